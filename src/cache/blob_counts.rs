use crate::cache::{Error, ManifestHolder};
use crate::oci::Digest;
use std::collections::{BTreeSet, HashMap};
use tracing::error;

/// Number of cached image manifests referencing each blob.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlobCounts {
    counts: HashMap<Digest, u64>,
}

impl BlobCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recomputes the table from a set of distinct cached manifests.
    pub fn from_holders<'a>(holders: impl IntoIterator<Item = &'a ManifestHolder>) -> Self {
        let mut counts = Self::new();
        for holder in holders {
            counts.add(holder);
        }
        counts
    }

    /// Counts the layers of `holder` once. List manifests contribute nothing.
    pub fn add(&mut self, holder: &ManifestHolder) {
        for digest in distinct(holder.layers()) {
            *self.counts.entry(digest).or_insert(0) += 1;
        }
    }

    /// Releases the layers of `holder` and returns the blobs that became
    /// orphans. The table is left untouched if any count would underflow.
    pub fn release(&mut self, holder: &ManifestHolder) -> Result<Vec<Digest>, Error> {
        let layers = distinct(holder.layers());

        if let Some(digest) = layers
            .iter()
            .find(|digest| self.counts.get(*digest).copied().unwrap_or(0) == 0)
        {
            let msg = format!(
                "Blob reference count underflow for {digest} while releasing {}",
                holder.image_url
            );
            error!("{msg}");
            return Err(Error::Fatal(msg));
        }

        let mut orphans = Vec::new();
        for digest in layers {
            if let Some(count) = self.counts.get_mut(&digest) {
                *count -= 1;
                if *count == 0 {
                    orphans.push(digest);
                }
            }
        }
        Ok(orphans)
    }

    pub fn count(&self, digest: &Digest) -> u64 {
        self.counts.get(digest).copied().unwrap_or(0)
    }

    /// Forgets a blob once its file has been deleted.
    pub fn forget(&mut self, digest: &Digest) {
        self.counts.remove(digest);
    }

    #[cfg(test)]
    pub fn orphans(&self) -> Vec<Digest> {
        self.counts
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(digest, _)| digest.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }
}

fn distinct(digests: Vec<Digest>) -> BTreeSet<Digest> {
    digests.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manifest_holder::tests::{image_manifest_bytes, index_bytes};

    fn holder(config: &[u8], layers: &[&[u8]]) -> ManifestHolder {
        ManifestHolder::new("h.io/a/b:v1", None, image_manifest_bytes(config, layers)).unwrap()
    }

    #[test]
    fn test_add_and_release() {
        let first = holder(b"c1", &[b"shared", b"l1"]);
        let second = holder(b"c2", &[b"shared", b"l2"]);

        let mut counts = BlobCounts::new();
        counts.add(&first);
        counts.add(&second);

        let shared = Digest::sha256_of(b"shared");
        assert_eq!(counts.count(&shared), 2);
        assert_eq!(counts.count(&Digest::sha256_of(b"l1")), 1);
        assert_eq!(counts.len(), 5);

        let mut orphans = counts.release(&first).unwrap();
        orphans.sort();
        let mut expected = vec![Digest::sha256_of(b"c1"), Digest::sha256_of(b"l1")];
        expected.sort();
        assert_eq!(orphans, expected);
        assert_eq!(counts.count(&shared), 1);
        assert_eq!(counts.orphans().len(), 2);
    }

    #[test]
    fn test_duplicate_layers_count_once() {
        let h = holder(b"c", &[b"same", b"same"]);
        let mut counts = BlobCounts::new();
        counts.add(&h);
        assert_eq!(counts.count(&Digest::sha256_of(b"same")), 1);
        assert_eq!(counts.release(&h).unwrap().len(), 2);
    }

    #[test]
    fn test_underflow_is_fatal() {
        let h = holder(b"c", &[b"l"]);
        let mut counts = BlobCounts::new();
        counts.add(&holder(b"c", &[b"other"]));
        let before = counts.clone();

        assert!(matches!(counts.release(&h), Err(Error::Fatal(_))));
        assert_eq!(counts, before);
    }

    #[test]
    fn test_list_manifest_contributes_nothing() {
        let list = ManifestHolder::new("h.io/a/b:v1", None, index_bytes(&[b"m1", b"m2"])).unwrap();
        let mut counts = BlobCounts::new();
        counts.add(&list);
        assert_eq!(counts.len(), 0);
        assert!(counts.release(&list).unwrap().is_empty());
    }

    #[test]
    fn test_from_holders() {
        let first = holder(b"c1", &[b"shared"]);
        let second = holder(b"c2", &[b"shared"]);

        let mut incremental = BlobCounts::new();
        incremental.add(&first);
        incremental.add(&second);

        assert_eq!(BlobCounts::from_holders([&first, &second]), incremental);
    }

    #[test]
    fn test_forget() {
        let h = holder(b"c", &[b"l"]);
        let mut counts = BlobCounts::new();
        counts.add(&h);
        for digest in counts.release(&h).unwrap() {
            counts.forget(&digest);
        }
        assert_eq!(counts.len(), 0);
    }
}
