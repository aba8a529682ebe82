use crate::metrics_provider::{CACHE_HITS, CACHE_MISSES, UPSTREAM_PULLS, UPSTREAM_PULL_FAILURES};
use crate::oci::Digest;
use crate::upstream::Upstream;
use chrono::Utc;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

mod blob_counts;
mod error;
mod index;
pub mod manifest_holder;
pub mod prune;
mod pull_request;
mod single_flight;
mod store;

pub use blob_counts::BlobCounts;
pub use error::Error;
pub use index::{Change, ManifestIndex};
pub use manifest_holder::ManifestHolder;
pub use pull_request::{PullRequest, PullType, LATEST_TAG};
pub use single_flight::{Flight, SingleFlight};
pub use store::Store;

const QUIESCENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Counts from the startup reconciliation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadReport {
    pub loaded: usize,
    pub rejected: usize,
}

/// Owns the manifest index, the blob reference counts and the single-flight
/// table, and serves manifests from the store or through the upstream.
///
/// Locks are taken in the order single-flight, index, blob counts, and are
/// never held across upstream I/O.
pub struct Coordinator {
    store: Store,
    upstream: Arc<dyn Upstream>,
    single_flight: SingleFlight,
    index: Mutex<ManifestIndex>,
    blob_counts: RwLock<BlobCounts>,
    pull_timeout: Duration,
    always_pull_latest: bool,
    air_gapped: bool,
}

impl Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("root", &self.store.root())
            .field("air_gapped", &self.air_gapped)
            .finish()
    }
}

impl Coordinator {
    pub fn new(store: Store, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            store,
            upstream,
            single_flight: SingleFlight::new(),
            index: Mutex::new(ManifestIndex::new()),
            blob_counts: RwLock::new(BlobCounts::new()),
            pull_timeout: Duration::from_secs(60),
            always_pull_latest: false,
            air_gapped: false,
        }
    }

    pub fn with_pull_timeout(mut self, pull_timeout: Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    pub fn with_always_pull_latest(mut self, always_pull_latest: bool) -> Self {
        self.always_pull_latest = always_pull_latest;
        self
    }

    pub fn with_air_gapped(mut self, air_gapped: bool) -> Self {
        self.air_gapped = air_gapped;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Rebuilds the index and blob counts from the store. Holders with
    /// missing blobs are left on disk but not served; a later pull repairs them.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<LoadReport, Error> {
        self.store.init().await?;

        let mut report = LoadReport::default();
        let mut index = self.index.lock().await;
        let mut counts = self.blob_counts.write().await;

        for (holder, path) in self.store.walk().await? {
            let missing = self.store.missing_blobs(&holder).await;
            if !missing.is_empty() {
                warn!(
                    "Not serving {} from {}: {} blob(s) missing",
                    holder.image_url,
                    path.display(),
                    missing.len()
                );
                report.rejected += 1;
                continue;
            }

            // Leftover of an interrupted replacement: keep the newer pull
            if let Some(current) = index.get(&holder.image_url) {
                if current.digest != holder.digest && current.pulled >= holder.pulled {
                    debug!("Skipping stale holder {}", path.display());
                    continue;
                }
            }

            let holder = Arc::new(holder);
            let mut changes = vec![index.insert(&holder.image_url, holder.clone())];
            if let Some(digest_url) = holder.digest_url() {
                if digest_url != holder.image_url {
                    changes.push(index.insert(&digest_url, holder.clone()));
                }
            }

            for digest in apply_changes(&mut counts, changes)? {
                counts.forget(&digest);
            }
            report.loaded += 1;
        }

        info!(
            "Loaded {} cached manifests ({} rejected), {} blobs referenced",
            report.loaded,
            report.rejected,
            counts.len()
        );
        Ok(report)
    }

    /// Returns the manifest for `pull_request`, pulling it from the upstream
    /// on a miss or when `force_pull` is set.
    #[instrument(skip(self, pull_request), fields(url = %pull_request))]
    pub async fn get_manifest(
        self: &Arc<Self>,
        pull_request: &PullRequest,
        force_pull: bool,
    ) -> Result<Arc<ManifestHolder>, Error> {
        let url = pull_request.url();
        let digest = pull_request.digest();
        let force_pull = force_pull || (self.always_pull_latest && pull_request.is_latest());

        if self.air_gapped || !force_pull {
            let mut index = self.index.lock().await;
            if let Some(holder) = index.lookup(&url, digest.as_ref()) {
                CACHE_HITS.inc();
                return Ok(self.touch(&mut index, holder).await);
            }
            drop(index);
            if self.air_gapped {
                debug!("Air-gapped miss for {url}");
                return Err(Error::NotFound);
            }
        }

        CACHE_MISSES.inc();
        match self.single_flight.enqueue(&url) {
            Flight::Leader(leader) => {
                let coordinator = self.clone();
                let pull_request = pull_request.clone();
                // The pull outlives the request so its result still lands in
                // the cache when the client goes away or times out
                let task = tokio::spawn(async move {
                    let outcome = coordinator.pull(&pull_request, force_pull).await;
                    leader.complete(outcome.as_ref().map(|_| ()).map_err(Clone::clone));
                    outcome
                });

                match timeout(self.pull_timeout, task).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(e)) => Err(Error::Internal(format!("Pull task failed: {e}"))),
                    Err(_) => {
                        warn!("Pull of {url} still running after {:?}", self.pull_timeout);
                        Err(Error::Timeout)
                    }
                }
            }
            Flight::Waiter(receiver) => match timeout(self.pull_timeout, receiver).await {
                Err(_) => {
                    warn!("Timed out waiting for pull of {url}");
                    Err(Error::Timeout)
                }
                Ok(Err(_)) => Err(Error::UpstreamFailed(format!(
                    "Pull of {url} ended without outcome"
                ))),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Ok(Ok(()))) => self
                    .index
                    .lock()
                    .await
                    .lookup(&url, digest.as_ref())
                    .ok_or(Error::NotFound),
            },
        }
    }

    /// Records that `holder` was served. Runs under the index lock so a
    /// concurrent prune or replacement cannot see the holder file come back.
    /// Failing to persist the timestamp does not fail the request.
    async fn touch(
        &self,
        index: &mut ManifestIndex,
        holder: Arc<ManifestHolder>,
    ) -> Arc<ManifestHolder> {
        let mut updated = (*holder).clone();
        updated.pulled = Utc::now();
        let updated = Arc::new(updated);

        if !index.refresh(&holder, &updated) {
            debug!("{} left the index before it was touched", holder.image_url);
            return holder;
        }

        if let Err(e) = self.store.write_holder(&updated).await {
            warn!("Unable to record pull time of {}: {e}", updated.image_url);
        }
        updated
    }

    /// Leader side of a pull: fetch, persist, download blobs, then publish.
    async fn pull(
        &self,
        pull_request: &PullRequest,
        force_pull: bool,
    ) -> Result<Arc<ManifestHolder>, Error> {
        let url = pull_request.url();
        let digest = pull_request.digest();

        let previous = {
            let index = self.index.lock().await;
            if !force_pull {
                // Another leader may have published it since our lookup
                if let Some(holder) = index.lookup(&url, digest.as_ref()) {
                    return Ok(holder);
                }
            }
            index.get(&url)
        };

        UPSTREAM_PULLS.inc();
        let mut holder = self
            .upstream
            .get_manifest(pull_request)
            .await
            .inspect_err(|e| {
                UPSTREAM_PULL_FAILURES.inc();
                warn!("Upstream manifest pull of {url} failed: {e}");
            })?;

        let first_seen = match holder.digest_url() {
            Some(digest_url) => self
                .index
                .lock()
                .await
                .lookup(&digest_url, Some(&holder.digest)),
            None => None,
        };
        let now = Utc::now();
        holder.created = first_seen.map_or(now, |cached| cached.created);
        holder.pulled = now;

        self.store.write_holder(&holder).await?;

        if holder.is_image_manifest() {
            self.upstream
                .pull_blobs(&holder, &self.store.blob_dir())
                .await
                .inspect_err(|e| {
                    UPSTREAM_PULL_FAILURES.inc();
                    warn!("Blob pull for {url} failed: {e}");
                })?;
        }

        self.publish(pull_request, previous, Arc::new(holder)).await
    }

    /// Makes `holder` servable under its URL and its by-digest URL, then
    /// settles the blob counts. Blobs only the replaced manifest referenced
    /// are deleted.
    async fn publish(
        &self,
        pull_request: &PullRequest,
        previous: Option<Arc<ManifestHolder>>,
        holder: Arc<ManifestHolder>,
    ) -> Result<Arc<ManifestHolder>, Error> {
        let url = pull_request.url();
        let mut index = self.index.lock().await;
        let mut counts = self.blob_counts.write().await;

        // Checked under the locks: a prune may have taken a shared blob
        // between the download and this point
        let missing = self.store.missing_blobs(&holder).await;
        if let Some(digest) = missing.first() {
            error!("Blob {digest} of {url} is absent, not publishing");
            return Err(Error::MissingBlob(digest.to_string()));
        }

        let mut changes = vec![index.insert(&url, holder.clone())];
        if pull_request.pull_type == PullType::ByTag {
            if let Some(digest_url) = holder.digest_url() {
                changes.push(index.insert(&digest_url, holder.clone()));
            }
        }

        if let Some(previous) = previous.filter(|previous| previous.digest != holder.digest) {
            info!("{url} moved from {} to {}", previous.digest, holder.digest);
            // The old by-digest URL goes once no tag serves that digest anymore
            if let Some(old_digest_url) = previous.digest_url() {
                if index.urls(&previous.digest) == [old_digest_url.clone()] {
                    changes.push(index.remove(&old_digest_url));
                }
            }
        }

        let removed: Vec<Digest> = changes
            .iter()
            .filter_map(|change| change.removed.as_ref())
            .map(|removed| removed.digest.clone())
            .collect();

        for digest in apply_changes(&mut counts, changes)? {
            match self.store.remove_blob(&digest).await {
                Ok(()) => {
                    debug!("Removed unreferenced blob {digest}");
                    counts.forget(&digest);
                }
                Err(e) => error!("Unable to remove unreferenced blob {digest}: {e}"),
            }
        }

        for digest in removed {
            if let Err(e) = self.store.remove_digest(&digest).await {
                error!("Unable to remove replaced manifest {digest}: {e}");
            }
        }

        Ok(holder)
    }

    /// Opens a cached blob. A blob that a cached manifest references but
    /// that is gone from disk is reported as missing.
    pub async fn get_blob(&self, digest: &Digest) -> Result<(tokio::fs::File, u64), Error> {
        match self.store.open_blob(digest).await {
            Ok(file) => {
                let size = file.metadata().await?.len();
                Ok((file, size))
            }
            Err(Error::NotFound) => {
                if self.blob_counts.read().await.count(digest) > 0 {
                    error!("Referenced blob {digest} is missing from the store");
                    Err(Error::MissingBlob(digest.to_string()))
                } else {
                    Err(Error::NotFound)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Prunes while serving. The index and blob count locks are held for
    /// the whole run so the census stays consistent. Holder files on disk
    /// that are not indexed are pruned too when they match.
    #[instrument(skip(self, selector))]
    pub async fn prune(
        &self,
        selector: &prune::Selector,
        dry_run: bool,
    ) -> Result<prune::PruneReport, Error> {
        let mut index = self.index.lock().await;
        let mut counts = self.blob_counts.write().await;

        let indexed = index.holders();
        let mut plan = prune::plan(&indexed, selector)?;
        let on_disk = self
            .store
            .walk()
            .await?
            .into_iter()
            .map(|(holder, _)| holder)
            .collect();
        prune::add_unindexed(&mut plan, &indexed, on_disk, selector, |url| {
            self.single_flight.is_pending(url)
        });

        if !dry_run {
            for holder in &plan.manifests {
                index.remove_holder(holder);
            }
            *counts = plan.counts.clone();
        }

        let report = prune::execute(&self.store, &plan, dry_run).await;
        info!(
            "Prune finished: {} manifests, {} blobs, {} errors{}",
            report.manifests,
            report.blobs,
            report.errors,
            if dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    /// Pulls `pull_request` into the cache. A list manifest is followed to
    /// the member matching `os`/`architecture`, which is pulled as well.
    pub async fn preload(
        self: &Arc<Self>,
        pull_request: &PullRequest,
        os: &str,
        architecture: &str,
    ) -> Result<Vec<Arc<ManifestHolder>>, Error> {
        let holder = self.get_manifest(pull_request, false).await?;
        if holder.is_image_manifest() {
            return Ok(vec![holder]);
        }

        let member = holder
            .manifest
            .platform_member(os, architecture)
            .map(|descriptor| descriptor.digest.clone())
            .ok_or_else(|| {
                warn!("{pull_request} has no {os}/{architecture} image");
                Error::NotFound
            })?;

        let image = self
            .get_manifest(&pull_request.alt_by_digest(&member), false)
            .await?;
        Ok(vec![holder, image])
    }

    /// Waits until no upstream pull is in flight. Returns false when pulls
    /// were still running at the deadline.
    pub async fn wait_for_quiescence(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;

        while !self.single_flight.is_idle() {
            if Instant::now() >= deadline {
                warn!(
                    "Giving up on {} in-flight pull(s)",
                    self.single_flight.in_flight()
                );
                return false;
            }
            sleep(QUIESCENCE_POLL_INTERVAL).await;
        }
        true
    }
}

/// Applies index transitions to the blob counts: every addition before any
/// release so blobs shared by the old and new manifest never reach zero.
/// Returns the blobs left unreferenced.
fn apply_changes(counts: &mut BlobCounts, changes: Vec<Change>) -> Result<Vec<Digest>, Error> {
    let (added, removed): (Vec<_>, Vec<_>) = changes
        .into_iter()
        .map(|change| (change.added, change.removed))
        .unzip();

    for holder in added.iter().flatten() {
        counts.add(holder);
    }

    let mut orphans = Vec::new();
    for holder in removed.iter().flatten() {
        orphans.extend(counts.release(holder)?);
    }
    Ok(orphans)
}
