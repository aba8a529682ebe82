use crate::cache::{BlobCounts, Error, ManifestHolder, Store};
use crate::metrics_provider::{PRUNED_BLOBS, PRUNED_MANIFESTS};
use crate::oci::Digest;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Chooses which cached manifests a prune removes.
#[derive(Clone, Debug)]
pub enum Selector {
    /// The image URL matches at least one of the expressions.
    Patterns(Vec<Regex>),
    /// Created strictly before the cutoff.
    CreatedBefore(DateTime<Utc>),
    /// Last served strictly before the cutoff.
    PulledBefore(DateTime<Utc>),
}

impl Selector {
    /// Parses a comma-separated list of regular expressions.
    pub fn patterns(patterns: &str) -> Result<Self, Error> {
        let patterns = patterns
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    Error::InvalidReference(format!("Invalid pattern '{pattern}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if patterns.is_empty() {
            return Err(Error::InvalidReference("Empty pattern list".to_string()));
        }
        Ok(Selector::Patterns(patterns))
    }

    /// Parses a `YYYY-MM-DDTHH:MM:SS` cutoff, interpreted as UTC.
    pub fn created_before(cutoff: &str) -> Result<Self, Error> {
        let cutoff = NaiveDateTime::parse_from_str(cutoff, DATE_FORMAT).map_err(|e| {
            Error::InvalidReference(format!("Invalid date '{cutoff}', expected {DATE_FORMAT}: {e}"))
        })?;
        Ok(Selector::CreatedBefore(cutoff.and_utc()))
    }

    pub fn matches(&self, holder: &ManifestHolder) -> bool {
        match self {
            Selector::Patterns(patterns) => patterns
                .iter()
                .any(|pattern| pattern.is_match(&holder.image_url)),
            Selector::CreatedBefore(cutoff) => holder.created < *cutoff,
            Selector::PulledBefore(cutoff) => holder.pulled < *cutoff,
        }
    }
}

/// Outcome of the selection and accounting steps, before anything is deleted.
#[derive(Debug)]
pub struct PrunePlan {
    /// Holder files to delete.
    pub manifests: Vec<Arc<ManifestHolder>>,
    /// Blobs whose reference count dropped to zero.
    pub blobs: Vec<Digest>,
    /// Blob census after the selected manifests are released.
    pub counts: BlobCounts,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PruneReport {
    pub manifests: usize,
    pub blobs: usize,
    pub errors: usize,
    pub dry_run: bool,
}

/// Selects, expands and accounts a prune over `holders` (one entry per
/// holder file). Fails only when the blob accounting is inconsistent.
#[instrument(skip_all, fields(holders = holders.len()))]
pub fn plan(holders: &[Arc<ManifestHolder>], selector: &Selector) -> Result<PrunePlan, Error> {
    let mut matched: BTreeSet<usize> = holders
        .iter()
        .enumerate()
        .filter(|(_, holder)| selector.matches(holder))
        .map(|(i, _)| i)
        .collect();

    let members: HashSet<Digest> = matched
        .iter()
        .flat_map(|i| holders[*i].member_digests())
        .collect();
    for (i, holder) in holders.iter().enumerate() {
        if members.contains(&holder.digest) && matched.insert(i) {
            info!("Pruning {} as member of a selected list", holder.image_url);
        }
    }

    let mut seen = HashSet::new();
    let distinct_images: Vec<&ManifestHolder> = holders
        .iter()
        .filter(|holder| holder.is_image_manifest() && seen.insert(holder.digest.clone()))
        .map(|holder| &**holder)
        .collect();
    let mut counts = BlobCounts::from_holders(distinct_images);

    // A digest is only released when every file holding it goes away
    let retained: HashSet<&Digest> = holders
        .iter()
        .enumerate()
        .filter(|(i, _)| !matched.contains(i))
        .map(|(_, holder)| &holder.digest)
        .collect();

    let mut released = HashSet::new();
    let mut blobs = Vec::new();
    for i in &matched {
        let holder = &holders[*i];
        if retained.contains(&holder.digest) || !released.insert(holder.digest.clone()) {
            continue;
        }
        blobs.extend(counts.release(holder)?);
    }

    for digest in &blobs {
        counts.forget(digest);
    }

    Ok(PrunePlan {
        manifests: matched.into_iter().map(|i| holders[i].clone()).collect(),
        blobs,
        counts,
    })
}

/// Adds holder files that are on disk but not indexed, such as the ones the
/// loader refused to serve, when they match `selector` or are members of a
/// selected list. They are deleted without touching the blob counts. Files
/// for which `in_flight` holds belong to a pull that has not published yet.
pub fn add_unindexed(
    plan: &mut PrunePlan,
    indexed: &[Arc<ManifestHolder>],
    on_disk: Vec<ManifestHolder>,
    selector: &Selector,
    in_flight: impl Fn(&str) -> bool,
) {
    let members: HashSet<Digest> = plan
        .manifests
        .iter()
        .flat_map(|holder| holder.member_digests())
        .collect();

    for holder in on_disk {
        let is_indexed = indexed.iter().any(|entry| {
            entry.digest == holder.digest && entry.is_latest() == holder.is_latest()
        });
        if is_indexed || in_flight(&holder.image_url) {
            continue;
        }

        if selector.matches(&holder) || members.contains(&holder.digest) {
            info!("Pruning unindexed holder {} ({})", holder.image_url, holder.digest);
            plan.manifests.push(Arc::new(holder));
        }
    }
}

/// Deletes the planned blobs then the planned holder files. File system
/// errors are logged and counted; the remaining work still proceeds.
pub async fn execute(store: &Store, plan: &PrunePlan, dry_run: bool) -> PruneReport {
    let mut report = PruneReport {
        dry_run,
        ..PruneReport::default()
    };

    for digest in &plan.blobs {
        if dry_run {
            info!("Would remove blob {digest}");
            report.blobs += 1;
            continue;
        }

        match store.remove_blob(digest).await {
            Ok(()) => {
                info!("Removed blob {digest}");
                PRUNED_BLOBS.inc();
                report.blobs += 1;
            }
            Err(e) => {
                error!("Failed to remove blob {digest}: {e}");
                report.errors += 1;
            }
        }
    }

    for holder in &plan.manifests {
        if dry_run {
            info!("Would remove manifest {} ({})", holder.image_url, holder.digest);
            report.manifests += 1;
            continue;
        }

        match store.remove_holder(holder).await {
            Ok(()) => {
                info!("Removed manifest {} ({})", holder.image_url, holder.digest);
                PRUNED_MANIFESTS.inc();
                report.manifests += 1;
            }
            Err(e) => {
                error!("Failed to remove manifest {}: {e}", holder.image_url);
                report.errors += 1;
            }
        }
    }

    report
}

/// Prunes a cache directory no server is using. Blob files that no remaining
/// image manifest references are removed as well.
#[instrument(skip(store, selector))]
pub async fn prune_offline(
    store: &Store,
    selector: &Selector,
    dry_run: bool,
) -> Result<PruneReport, Error> {
    let holders: Vec<Arc<ManifestHolder>> = store
        .walk()
        .await?
        .into_iter()
        .map(|(holder, _)| Arc::new(holder))
        .collect();

    let mut plan = plan(&holders, selector)?;

    let planned: HashSet<Digest> = plan.blobs.iter().cloned().collect();
    for digest in store.list_blobs().await? {
        if plan.counts.count(&digest) == 0 && !planned.contains(&digest) {
            warn!("Blob {digest} is not referenced by any cached manifest");
            plan.blobs.push(digest);
        }
    }

    Ok(execute(store, &plan, dry_run).await)
}
