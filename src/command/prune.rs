use crate::cache::prune::{prune_offline, PruneReport, Selector};
use crate::cache::Store;
use crate::command;
use crate::configuration::CacheConfig;
use argh::FromArgs;
use tracing::info;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "prune",
    description = "Remove manifests and unreferenced blobs from the cache directory"
)]
pub struct Options {
    #[argh(option, short = 'p')]
    /// comma-separated regular expressions matched against image URLs
    pub patterns: Option<String>,
    #[argh(option, short = 'd')]
    /// remove manifests created before this UTC date (YYYY-MM-DDTHH:MM:SS)
    pub date: Option<String>,
    #[argh(switch)]
    /// only report what would be removed
    pub dry_run: bool,
}

impl Options {
    pub fn selector(&self) -> Result<Selector, command::Error> {
        let selector = match (&self.patterns, &self.date) {
            (Some(patterns), None) => Selector::patterns(patterns)?,
            (None, Some(date)) => Selector::created_before(date)?,
            _ => {
                let msg = "exactly one of --patterns or --date is required".to_string();
                return Err(command::Error::InvalidArguments(msg));
            }
        };
        Ok(selector)
    }
}

pub struct Command {
    store: Store,
    selector: Selector,
    dry_run: bool,
}

impl Command {
    pub fn new(options: &Options, config: &CacheConfig) -> Result<Self, command::Error> {
        if options.dry_run {
            info!("Dry-run mode: no changes will be made to the cache");
        }

        Ok(Self {
            store: Store::new(config.image_path.clone(), config.sync_to_disk),
            selector: options.selector()?,
            dry_run: options.dry_run,
        })
    }

    pub async fn run(&self) -> Result<PruneReport, command::Error> {
        let report = prune_offline(&self.store, &self.selector, self.dry_run).await?;
        info!(
            "Pruned {} manifest(s) and {} blob(s), {} error(s){}",
            report.manifests,
            report.blobs,
            report.errors,
            if report.dry_run { " (dry run)" } else { "" }
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::manifest_holder::tests::image_manifest_bytes;
    use crate::cache::ManifestHolder;
    use tempfile::TempDir;

    fn options(patterns: Option<&str>, date: Option<&str>, dry_run: bool) -> Options {
        Options {
            patterns: patterns.map(str::to_string),
            date: date.map(str::to_string),
            dry_run,
        }
    }

    #[test]
    fn test_selector_requires_exactly_one_criterion() {
        assert!(matches!(
            options(None, None, false).selector(),
            Err(command::Error::InvalidArguments(_))
        ));
        assert!(matches!(
            options(Some("app"), Some("2024-01-01T00:00:00"), false).selector(),
            Err(command::Error::InvalidArguments(_))
        ));
        assert!(matches!(
            options(Some("app"), None, false).selector(),
            Ok(Selector::Patterns(_))
        ));
        assert!(matches!(
            options(None, Some("2024-01-01T00:00:00"), false).selector(),
            Ok(Selector::CreatedBefore(_))
        ));
        assert!(matches!(
            options(None, Some("yesterday"), false).selector(),
            Err(command::Error::Cache(_))
        ));
    }

    async fn populate(store: &Store) {
        store.init().await.unwrap();
        for name in ["keep", "drop"] {
            let layer = format!("{name}-layer");
            let bytes = image_manifest_bytes(b"config", &[layer.as_bytes()]);
            let holder =
                ManifestHolder::new(&format!("docker.io/library/{name}:v1"), None, bytes).unwrap();
            store.write_holder(&holder).await.unwrap();
            for blob in [b"config".as_slice(), layer.as_bytes()] {
                let digest = crate::oci::Digest::sha256_of(blob);
                std::fs::write(store.blob_path(&digest), blob).unwrap();
            }
        }
        let stray = crate::oci::Digest::sha256_of(b"stray");
        std::fs::write(store.blob_path(&stray), b"stray").unwrap();
    }

    #[tokio::test]
    async fn test_offline_prune() {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            image_path: dir.path().to_path_buf(),
            ..CacheConfig::default()
        };
        let store = Store::new(dir.path(), false);
        populate(&store).await;

        let command = Command::new(&options(Some("drop"), None, true), &config).unwrap();
        let report = command.run().await.unwrap();
        assert!(report.dry_run);
        assert_eq!(std::fs::read_dir(store.blob_dir()).unwrap().count(), 4);

        let command = Command::new(&options(Some("drop"), None, false), &config).unwrap();
        let report = command.run().await.unwrap();
        assert_eq!(report.manifests, 1);
        assert_eq!(report.blobs, 2);

        let remaining = store.list_blobs().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.contains(&crate::oci::Digest::sha256_of(b"keep-layer")));
        assert!(remaining.contains(&crate::oci::Digest::sha256_of(b"config")));
    }
}
