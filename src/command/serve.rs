use crate::cache::prune::Selector;
use crate::cache::Coordinator;
use crate::command::{self, build_coordinator, load};
use crate::configuration::{Configuration, PruneConfig, PruneKind};
use crate::server::{ServerContext, ServiceListener};
use crate::upstream::RegistryClient;
use argh::FromArgs;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "serve",
    description = "Run the pull-through cache server"
)]
pub struct Options {}

pub struct Command {
    config: Configuration,
    client: Arc<RegistryClient>,
    coordinator: Arc<Coordinator>,
    listener: ServiceListener,
}

impl PruneConfig {
    /// Selector for manifests older than `max_age_days`, measured from now.
    pub fn selector(&self) -> Selector {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(self.max_age_days));
        match self.kind {
            PruneKind::Accessed => Selector::PulledBefore(cutoff),
            PruneKind::Created => Selector::CreatedBefore(cutoff),
        }
    }
}

impl Command {
    pub fn new(config: Configuration) -> Result<Self, command::Error> {
        let client = Arc::new(RegistryClient::new(&config.registry)?);
        let coordinator = Arc::new(build_coordinator(&config.cache, client.clone()));

        let context = ServerContext::new(
            coordinator.clone(),
            &config.cache.default_upstream,
            config.server.tls.is_some(),
        );
        let listener = ServiceListener::new(&config.server, context)?;

        Ok(Self {
            config,
            client,
            coordinator,
            listener,
        })
    }

    /// The upstream client, whose registry table follows configuration reloads.
    pub fn client(&self) -> Arc<RegistryClient> {
        self.client.clone()
    }

    pub async fn run(&self) -> Result<(), command::Error> {
        self.coordinator.load().await?;

        if let Some(path) = self.config.cache.preload_images.clone() {
            let coordinator = self.coordinator.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = load::load_images(&coordinator, &config, &path).await {
                    error!("Preloading images from {} failed: {e}", path.display());
                }
            });
        }

        if self.config.prune.enabled {
            tokio::spawn(prune_periodically(
                self.coordinator.clone(),
                self.config.prune.clone(),
            ));
        }

        tokio::select! {
            result = self.listener.serve() => result?,
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutdown requested, waiting for in-flight pulls");
            }
        }

        if !self
            .coordinator
            .wait_for_quiescence(SHUTDOWN_GRACE_PERIOD)
            .await
        {
            warn!("Exiting with pulls still in flight");
        }
        Ok(())
    }
}

async fn prune_periodically(coordinator: Arc<Coordinator>, config: PruneConfig) {
    info!(
        "Pruning manifests older than {} day(s) every {}s",
        config.max_age_days, config.interval
    );
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval.max(1)));

    loop {
        interval.tick().await;
        if let Err(e) = coordinator.prune(&config.selector(), config.dry_run).await {
            error!("Background prune failed: {e}");
        }
    }
}
