use crate::cache::{ManifestHolder, PullRequest};
use crate::oci::Digest;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Presence changes caused by an index update. `added` is set when the
/// holder's digest was not indexed before, `removed` when the last URL for a
/// digest went away. Blob reference counts follow these transitions.
#[derive(Debug, Default)]
pub struct Change {
    pub added: Option<Arc<ManifestHolder>>,
    pub removed: Option<Arc<ManifestHolder>>,
}

/// URL to holder mapping split into a non-latest and a latest partition,
/// plus a reverse mapping from manifest digest to the URLs serving it.
///
/// A URL lives in the latest partition iff it addresses the `latest` tag, so
/// the by-digest twin of a latest pull is a non-latest entry.
#[derive(Debug, Default)]
pub struct ManifestIndex {
    non_latest: HashMap<String, Arc<ManifestHolder>>,
    latest: HashMap<String, Arc<ManifestHolder>>,
    by_digest: HashMap<Digest, HashSet<String>>,
}

fn is_latest_url(url: &str) -> bool {
    PullRequest::parse(url).is_ok_and(|pr| pr.is_latest())
}

/// Holders sharing a digest and partition are persisted as the same file.
fn same_file(a: &ManifestHolder, b: &ManifestHolder) -> bool {
    a.digest == b.digest && a.is_latest() == b.is_latest()
}

impl ManifestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, url: &str) -> &HashMap<String, Arc<ManifestHolder>> {
        if is_latest_url(url) {
            &self.latest
        } else {
            &self.non_latest
        }
    }

    fn partition_mut(&mut self, url: &str) -> &mut HashMap<String, Arc<ManifestHolder>> {
        if is_latest_url(url) {
            &mut self.latest
        } else {
            &mut self.non_latest
        }
    }

    /// Looks `url` up in the non-latest then the latest partition. When both
    /// miss and the request addresses a digest, any cached holder with that
    /// digest is returned.
    pub fn lookup(&self, url: &str, digest: Option<&Digest>) -> Option<Arc<ManifestHolder>> {
        if let Some(holder) = self.get(url) {
            return Some(holder);
        }

        let urls = self.by_digest.get(digest?)?;
        urls.iter().find_map(|url| self.get(url))
    }

    pub fn get(&self, url: &str) -> Option<Arc<ManifestHolder>> {
        self.non_latest
            .get(url)
            .or_else(|| self.latest.get(url))
            .cloned()
    }

    pub fn contains_digest(&self, digest: &Digest) -> bool {
        self.by_digest.contains_key(digest)
    }

    /// URLs currently serving `digest`.
    pub fn urls(&self, digest: &Digest) -> Vec<String> {
        self.by_digest
            .get(digest)
            .map(|urls| urls.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Indexes `holder` under `url`, replacing any previous entry for that URL.
    pub fn insert(&mut self, url: &str, holder: Arc<ManifestHolder>) -> Change {
        let mut change = self.remove(url);

        let urls = self.by_digest.entry(holder.digest.clone()).or_default();
        if urls.is_empty() {
            // Re-inserting the digest that was just dropped is not a transition
            match change.removed.take() {
                Some(removed) if removed.digest == holder.digest => {}
                removed => {
                    change.removed = removed;
                    change.added = Some(holder.clone());
                }
            }
        }
        urls.insert(url.to_string());

        self.partition_mut(url).insert(url.to_string(), holder);
        change
    }

    pub fn remove(&mut self, url: &str) -> Change {
        let Some(previous) = self.partition_mut(url).remove(url) else {
            return Change::default();
        };

        let mut change = Change::default();
        if let Some(urls) = self.by_digest.get_mut(&previous.digest) {
            urls.remove(url);
            if urls.is_empty() {
                self.by_digest.remove(&previous.digest);
                change.removed = Some(previous);
            }
        }
        change
    }

    /// Swaps every entry pointing at `current` for `updated`, e.g. after the
    /// pulled timestamp changed. Returns false when no entry holds `current`.
    pub fn refresh(&mut self, current: &Arc<ManifestHolder>, updated: &Arc<ManifestHolder>) -> bool {
        let Some(urls) = self.by_digest.get(&current.digest).cloned() else {
            return false;
        };

        let mut refreshed = false;
        for url in urls {
            if let Some(entry) = self.partition_mut(&url).get_mut(&url) {
                if Arc::ptr_eq(entry, current) {
                    *entry = updated.clone();
                    refreshed = true;
                }
            }
        }
        refreshed
    }

    /// Drops every URL whose holder is persisted as the same file as
    /// `holder`. Returns true when the digest is no longer indexed.
    pub fn remove_holder(&mut self, holder: &ManifestHolder) -> bool {
        let Some(urls) = self.by_digest.get(&holder.digest).cloned() else {
            return true;
        };

        for url in urls {
            let matches = self
                .partition(&url)
                .get(&url)
                .is_some_and(|entry| same_file(entry, holder));
            if matches {
                self.remove(&url);
            }
        }

        !self.contains_digest(&holder.digest)
    }

    /// All entries, non-latest partition first.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<ManifestHolder>)> {
        self.non_latest.iter().chain(self.latest.iter())
    }

    /// One holder per persisted file, the most recently pulled one when
    /// several entries share it.
    pub fn holders(&self) -> Vec<Arc<ManifestHolder>> {
        let mut holders: Vec<Arc<ManifestHolder>> = Vec::new();
        for (_, holder) in self.iter() {
            match holders.iter_mut().find(|h| same_file(h, holder)) {
                Some(existing) if existing.pulled < holder.pulled => *existing = holder.clone(),
                Some(_) => {}
                None => holders.push(holder.clone()),
            }
        }
        holders
    }

    pub fn len(&self) -> usize {
        self.non_latest.len() + self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manifest_holder::tests::image_manifest_bytes;

    fn holder(url: &str, content: &[u8]) -> Arc<ManifestHolder> {
        let bytes = image_manifest_bytes(content, &[b"layer"]);
        Arc::new(ManifestHolder::new(url, None, bytes).unwrap())
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = ManifestIndex::new();
        let h = holder("h.io/a/b:v1", b"one");
        let digest_url = h.digest_url().unwrap();

        let change = index.insert("h.io/a/b:v1", h.clone());
        assert_eq!(change.added.as_deref(), Some(&*h));
        assert!(change.removed.is_none());

        let change = index.insert(&digest_url, h.clone());
        assert!(change.added.is_none());
        assert!(change.removed.is_none());

        assert_eq!(index.len(), 2);
        assert_eq!(index.lookup("h.io/a/b:v1", None).unwrap().digest, h.digest);
        assert_eq!(index.lookup(&digest_url, None).unwrap().digest, h.digest);
        assert!(index.lookup("h.io/a/b:v2", None).is_none());
        assert_eq!(index.holders().len(), 1);
    }

    #[test]
    fn test_lookup_by_digest_fallback() {
        let mut index = ManifestIndex::new();
        let h = holder("h.io/a/b:v1", b"one");
        index.insert("h.io/a/b:v1", h.clone());

        let other_url = format!("h.io/mirror/b@{}", h.digest);
        assert!(index.lookup(&other_url, None).is_none());
        assert_eq!(
            index.lookup(&other_url, Some(&h.digest)).unwrap().image_url,
            "h.io/a/b:v1"
        );
    }

    #[test]
    fn test_partitions() {
        let mut index = ManifestIndex::new();
        let latest = holder("h.io/a/b:latest", b"two");
        index.insert("h.io/a/b:v1", holder("h.io/a/b:v1", b"one"));
        index.insert("h.io/a/b:latest", latest.clone());
        index.insert(&latest.digest_url().unwrap(), latest);

        assert_eq!(index.non_latest.len(), 2);
        assert_eq!(index.latest.len(), 1);

        let urls: Vec<&String> = index.iter().map(|(url, _)| url).collect();
        assert_eq!(urls.last().unwrap().as_str(), "h.io/a/b:latest");
    }

    #[test]
    fn test_replace() {
        let mut index = ManifestIndex::new();
        let old = holder("h.io/a/b:latest", b"old");
        let new = holder("h.io/a/b:latest", b"new");

        index.insert("h.io/a/b:latest", old.clone());
        let change = index.insert("h.io/a/b:latest", new.clone());
        assert_eq!(change.added.unwrap().digest, new.digest);
        assert_eq!(change.removed.unwrap().digest, old.digest);
        assert!(!index.contains_digest(&old.digest));

        // Same digest again is not a presence transition
        let change = index.insert("h.io/a/b:latest", new.clone());
        assert!(change.added.is_none());
        assert!(change.removed.is_none());
    }

    #[test]
    fn test_shared_digest_removal() {
        let mut index = ManifestIndex::new();
        let h = holder("h.io/a/b:v1", b"one");
        index.insert("h.io/a/b:v1", h.clone());
        index.insert("h.io/a/b:v1.0", h.clone());

        assert!(index.remove("h.io/a/b:v1").removed.is_none());
        assert_eq!(index.remove("h.io/a/b:v1.0").removed.unwrap().digest, h.digest);
        assert!(index.is_empty());
        assert!(index.remove("h.io/a/b:v1.0").removed.is_none());
    }

    #[test]
    fn test_refresh() {
        let mut index = ManifestIndex::new();
        let h = holder("h.io/a/b:v1", b"one");
        index.insert("h.io/a/b:v1", h.clone());
        index.insert(&h.digest_url().unwrap(), h.clone());

        let mut touched = (*h).clone();
        touched.pulled = h.pulled + chrono::Duration::seconds(5);
        let touched = Arc::new(touched);
        assert!(index.refresh(&h, &touched));

        for (_, entry) in index.iter() {
            assert!(Arc::ptr_eq(entry, &touched));
        }

        // The stale handle no longer matches any entry
        assert!(!index.refresh(&h, &touched));
        index.remove_holder(&touched);
        assert!(!index.refresh(&touched, &h));
    }

    #[test]
    fn test_remove_holder() {
        let mut index = ManifestIndex::new();
        let h = holder("h.io/a/b:v1", b"one");
        index.insert("h.io/a/b:v1", h.clone());
        index.insert(&h.digest_url().unwrap(), h.clone());

        let mut as_latest = (*h).clone();
        as_latest.image_url = "h.io/a/b:latest".to_string();
        index.insert("h.io/a/b:latest", Arc::new(as_latest));
        assert_eq!(index.holders().len(), 2);

        assert!(!index.remove_holder(&h));
        assert_eq!(index.len(), 1);
        assert!(index.get("h.io/a/b:latest").is_some());

        let remaining = index.get("h.io/a/b:latest").unwrap();
        assert!(index.remove_holder(&remaining));
        assert!(index.is_empty());
    }
}
