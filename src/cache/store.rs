use crate::cache::{Error, ManifestHolder};
use crate::oci::Digest;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, instrument};

const IMAGE_DIR: &str = "img";
const LATEST_DIR: &str = "lts";
const BLOB_DIR: &str = "blobs";

/// Content-addressed cache directory:
/// `img/<hex>` and `lts/<hex>` hold manifest holders, `blobs/<hex>` raw blobs.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
    sync_to_disk: bool,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, sync_to_disk: bool) -> Self {
        Self {
            root: root.into(),
            sync_to_disk,
        }
    }

    pub async fn init(&self) -> Result<(), Error> {
        for dir in [IMAGE_DIR, LATEST_DIR, BLOB_DIR] {
            fs::create_dir_all(self.root.join(dir)).await?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.root.join(BLOB_DIR)
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blob_dir().join(digest.hash())
    }

    fn holder_path(&self, digest: &Digest, latest: bool) -> PathBuf {
        let dir = if latest { LATEST_DIR } else { IMAGE_DIR };
        self.root.join(dir).join(digest.hash())
    }

    /// Writes the holder record through a temporary file renamed over the
    /// target, so a crash never leaves a partially written holder.
    #[instrument(skip(self, holder), fields(url = %holder.image_url))]
    pub async fn write_holder(&self, holder: &ManifestHolder) -> Result<(), Error> {
        let path = self.holder_path(&holder.digest, holder.is_latest());
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("Invalid holder path: {}", path.display())))?;
        fs::create_dir_all(parent).await?;

        let data = holder.to_json()?;
        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&data)?;

        if self.sync_to_disk {
            temp_file.flush()?;
            temp_file.as_file().sync_all()?;
        }

        temp_file.persist(&path)?;
        debug!("Wrote manifest holder to {}", path.display());
        Ok(())
    }

    pub async fn read_holder(&self, digest: &Digest, latest: bool) -> Result<ManifestHolder, Error> {
        let path = self.holder_path(digest, latest);
        let data = fs::read(&path).await?;
        ManifestHolder::from_json(&data).inspect_err(|e| {
            error!("Unable to decode manifest holder {}: {e}", path.display());
        })
    }

    pub async fn remove_holder(&self, holder: &ManifestHolder) -> Result<(), Error> {
        let path = self.holder_path(&holder.digest, holder.is_latest());
        remove_file(&path).await
    }

    /// Removes the holder files of `digest` from both partitions.
    pub async fn remove_digest(&self, digest: &Digest) -> Result<(), Error> {
        remove_file(&self.holder_path(digest, false)).await?;
        remove_file(&self.holder_path(digest, true)).await
    }

    pub async fn blob_exists(&self, digest: &Digest) -> bool {
        fs::try_exists(self.blob_path(digest))
            .await
            .unwrap_or(false)
    }

    pub async fn blob_size(&self, digest: &Digest) -> Result<u64, Error> {
        let metadata = fs::metadata(self.blob_path(digest)).await?;
        Ok(metadata.len())
    }

    pub async fn open_blob(&self, digest: &Digest) -> Result<fs::File, Error> {
        Ok(fs::File::open(self.blob_path(digest)).await?)
    }

    pub async fn remove_blob(&self, digest: &Digest) -> Result<(), Error> {
        remove_file(&self.blob_path(digest)).await
    }

    /// Referenced blobs of `holder` that are absent from `blobs/`.
    pub async fn missing_blobs(&self, holder: &ManifestHolder) -> Vec<Digest> {
        let mut missing = Vec::new();
        for digest in holder.layers() {
            if !self.blob_exists(&digest).await {
                missing.push(digest);
            }
        }
        missing
    }

    /// Loads every holder under `img/` then `lts/` with the path of its file.
    /// Undecodable records are logged and skipped.
    #[instrument(skip(self))]
    pub async fn walk(&self) -> Result<Vec<(ManifestHolder, PathBuf)>, Error> {
        let mut holders = Vec::new();

        for (dir, latest) in [(IMAGE_DIR, false), (LATEST_DIR, true)] {
            for path in list_files(&self.root.join(dir)).await? {
                let Some(digest) = file_digest(&path) else {
                    debug!("Skipping foreign file {}", path.display());
                    continue;
                };

                match self.read_holder(&digest, latest).await {
                    Ok(holder) => holders.push((holder, path)),
                    Err(Error::NotFound | Error::CorruptHolder(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(holders)
    }

    /// Digests of every blob file present on disk.
    pub async fn list_blobs(&self) -> Result<Vec<Digest>, Error> {
        Ok(list_files(&self.blob_dir())
            .await?
            .iter()
            .filter_map(|path| file_digest(path))
            .collect())
    }
}

fn file_digest(path: &Path) -> Option<Digest> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| Digest::from_hex(name).ok())
}

async fn list_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut entries = Vec::new();

    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_file() {
            entries.push(entry.path());
        }
    }

    Ok(entries)
}

async fn remove_file(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manifest_holder::tests::image_manifest_bytes;
    use tempfile::TempDir;

    async fn create_store() -> (TempDir, Store) {
        let tmp_dir = TempDir::new().unwrap();
        let store = Store::new(tmp_dir.path(), false);
        store.init().await.unwrap();
        (tmp_dir, store)
    }

    fn holder(url: &str) -> ManifestHolder {
        let bytes = image_manifest_bytes(url.as_bytes(), &[b"layer"]);
        ManifestHolder::new(url, None, bytes).unwrap()
    }

    #[tokio::test]
    async fn test_init_creates_layout() {
        let (tmp_dir, _store) = create_store().await;
        for dir in ["img", "lts", "blobs"] {
            assert!(tmp_dir.path().join(dir).is_dir());
        }
    }

    #[tokio::test]
    async fn test_write_and_read_holder() {
        let (tmp_dir, store) = create_store().await;
        let holder = holder("h.io/a/b:v1");

        store.write_holder(&holder).await.unwrap();
        assert!(tmp_dir
            .path()
            .join("img")
            .join(holder.digest.hash())
            .is_file());

        let loaded = store.read_holder(&holder.digest, false).await.unwrap();
        assert_eq!(loaded, holder);
        assert_eq!(
            store.read_holder(&holder.digest, true).await,
            Err(Error::NotFound)
        );
    }

    #[tokio::test]
    async fn test_latest_partition() {
        let (tmp_dir, store) = create_store().await;
        let holder = holder("h.io/a/b:latest");

        store.write_holder(&holder).await.unwrap();
        assert!(tmp_dir
            .path()
            .join("lts")
            .join(holder.digest.hash())
            .is_file());

        store.remove_holder(&holder).await.unwrap();
        assert_eq!(
            store.read_holder(&holder.digest, true).await,
            Err(Error::NotFound)
        );
        // Removing twice is not an error
        store.remove_holder(&holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_holder() {
        let (tmp_dir, store) = create_store().await;
        let digest = Digest::sha256_of(b"garbage");
        std::fs::write(tmp_dir.path().join("img").join(digest.hash()), b"garbage").unwrap();

        assert!(matches!(
            store.read_holder(&digest, false).await,
            Err(Error::CorruptHolder(_))
        ));
        assert!(store.walk().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_walk() {
        let (tmp_dir, store) = create_store().await;
        store.write_holder(&holder("h.io/a/b:v1")).await.unwrap();
        store.write_holder(&holder("h.io/a/c:v1")).await.unwrap();
        store.write_holder(&holder("h.io/a/b:latest")).await.unwrap();
        std::fs::write(tmp_dir.path().join("img").join(".tmpXYZ"), b"partial").unwrap();

        let holders = store.walk().await.unwrap();
        assert_eq!(holders.len(), 3);
        assert!(holders[0].1.starts_with(tmp_dir.path().join("img")));
        assert!(holders[1].1.starts_with(tmp_dir.path().join("img")));
        assert!(holders[2].1.starts_with(tmp_dir.path().join("lts")));
        assert_eq!(holders[2].0.image_url, "h.io/a/b:latest");
    }

    #[tokio::test]
    async fn test_blobs() {
        let (_tmp_dir, store) = create_store().await;
        let holder = holder("h.io/a/b:v1");
        let layers = holder.layers();

        assert_eq!(store.missing_blobs(&holder).await, layers);

        std::fs::write(store.blob_path(&layers[0]), holder.image_url.as_bytes()).unwrap();
        assert!(store.blob_exists(&layers[0]).await);
        assert_eq!(store.missing_blobs(&holder).await, vec![layers[1].clone()]);
        assert_eq!(store.blob_size(&layers[0]).await.unwrap(), 11);
        assert_eq!(store.list_blobs().await.unwrap(), vec![layers[0].clone()]);

        store.remove_blob(&layers[0]).await.unwrap();
        assert!(!store.blob_exists(&layers[0]).await);
        store.remove_blob(&layers[0]).await.unwrap();
    }
}
