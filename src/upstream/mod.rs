use crate::cache::{ManifestHolder, PullRequest};
use async_trait::async_trait;
use std::path::Path;

mod auth_scheme;
mod bearer_token;
mod client;
mod error;
mod registry;
mod token_cache;


pub use client::RegistryClient;
pub use error::Error;

/// Source of manifests and blobs for cache misses.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetches the manifest addressed by `pull_request`. The returned holder
    /// carries the canonical URL of the request as its image URL.
    async fn get_manifest(&self, pull_request: &PullRequest) -> Result<ManifestHolder, Error>;

    /// Downloads every blob referenced by `holder` into `blob_dir/<hex>`,
    /// skipping blobs already present. Each file is verified against its digest.
    async fn pull_blobs(&self, holder: &ManifestHolder, blob_dir: &Path) -> Result<(), Error>;
}
