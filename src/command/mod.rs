use std::sync::Arc;

use crate::cache::{Coordinator, Store};
use crate::configuration::CacheConfig;
use crate::upstream::Upstream;

mod error;
pub mod list;
pub mod load;
pub mod prune;
pub mod serve;

pub use error::Error;

/// Builds the coordinator for the cache directory named in `config`.
pub fn build_coordinator(config: &CacheConfig, upstream: Arc<dyn Upstream>) -> Coordinator {
    Coordinator::new(Store::new(config.image_path.clone(), config.sync_to_disk), upstream)
        .with_pull_timeout(config.pull_timeout())
        .with_always_pull_latest(config.always_pull_latest)
        .with_air_gapped(config.air_gapped)
}
