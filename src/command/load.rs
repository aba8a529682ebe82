use crate::cache::{Coordinator, PullRequest, LATEST_TAG};
use crate::command::{self, build_coordinator};
use crate::configuration::Configuration;
use crate::upstream::RegistryClient;
use argh::FromArgs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument};

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "load",
    description = "Pull the images listed in a file into the cache"
)]
pub struct Options {
    #[argh(option, short = 'f')]
    /// file with one image reference per line, `#` starts a comment
    pub file: PathBuf,
}

#[derive(Debug, Default, PartialEq)]
pub struct LoadSummary {
    pub pulled: usize,
    pub failed: usize,
}

/// Qualifies a reference as written on a `docker pull` command line:
/// a missing registry host becomes `default_upstream` and a missing tag
/// becomes `latest`.
pub fn qualify(reference: &str, default_upstream: &str) -> String {
    let has_host = reference.split_once('/').is_some_and(|(first, _)| {
        first.contains('.') || first.contains(':') || first == "localhost"
    });

    let reference = if has_host {
        reference.to_string()
    } else {
        format!("{default_upstream}/{reference}")
    };

    let last_segment = reference.rsplit('/').next().unwrap_or_default();
    if last_segment.contains(':') || last_segment.contains('@') {
        reference
    } else {
        format!("{reference}:{LATEST_TAG}")
    }
}

/// Reads an image list, dropping comments and blank lines.
pub fn parse_image_list(contents: &str, default_upstream: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(|line| qualify(line, default_upstream))
        .collect()
}

/// Pulls every image listed in `path`. List manifests are followed to the
/// image for the os/architecture configured for their registry.
#[instrument(skip(coordinator, config))]
pub async fn load_images(
    coordinator: &Arc<Coordinator>,
    config: &Configuration,
    path: &Path,
) -> Result<LoadSummary, command::Error> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut summary = LoadSummary::default();

    for reference in parse_image_list(&contents, &config.cache.default_upstream) {
        let pull_request = match PullRequest::parse(&reference) {
            Ok(pull_request) => pull_request,
            Err(e) => {
                error!("Skipping '{reference}': {e}");
                summary.failed += 1;
                continue;
            }
        };

        let registry = config.registry_config(&pull_request.remote);
        match coordinator
            .preload(&pull_request, &registry.os, &registry.arch)
            .await
        {
            Ok(holders) => {
                for holder in holders {
                    info!("Loaded {} ({})", holder.image_url, holder.digest);
                }
                summary.pulled += 1;
            }
            Err(e) => {
                error!("Failed to load {reference}: {e}");
                summary.failed += 1;
            }
        }
    }

    info!(
        "Loaded {} image(s) from {}, {} failed",
        summary.pulled,
        path.display(),
        summary.failed
    );
    Ok(summary)
}

pub struct Command {
    file: PathBuf,
    coordinator: Arc<Coordinator>,
    config: Configuration,
}

impl Command {
    pub fn new(options: &Options, config: Configuration) -> Result<Self, command::Error> {
        let client = Arc::new(RegistryClient::new(&config.registry)?);
        let coordinator = Arc::new(build_coordinator(&config.cache, client));

        Ok(Self {
            file: options.file.clone(),
            coordinator,
            config,
        })
    }

    pub async fn run(&self) -> Result<(), command::Error> {
        self.coordinator.load().await?;
        let summary = load_images(&self.coordinator, &self.config, &self.file).await?;

        if summary.failed > 0 {
            let msg = format!("{} image(s) could not be loaded", summary.failed);
            return Err(command::Error::InvalidArguments(msg));
        }
        Ok(())
    }
}
