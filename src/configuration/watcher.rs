use crate::configuration::Configuration;
use crate::upstream::RegistryClient;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Reloads the `[[registry]]` table into the live upstream client whenever
/// the configuration file changes.
pub struct ConfigWatcher {
    _handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn new(
        config_path: &str,
        client: Arc<RegistryClient>,
    ) -> Result<Self, crate::command::Error> {
        info!("Setting up config watcher for: {config_path}");

        let config_path = std::fs::canonicalize(PathBuf::from(config_path))?;

        let (tx, rx) = mpsc::channel::<Event>(100);
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })?;
        watcher.watch(&config_path, RecursiveMode::NonRecursive)?;

        let handle = tokio::spawn(async move {
            watch_config_loop(watcher, rx, &config_path, &client).await;
        });

        Ok(Self { _handle: handle })
    }
}

fn is_content_change(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) | EventKind::Create(_)
    )
}

async fn watch_config_loop(
    // Dropping the watcher stops notifications
    _watcher: notify::RecommendedWatcher,
    mut rx: mpsc::Receiver<Event>,
    config_path: &Path,
    client: &RegistryClient,
) {
    while let Some(event) = rx.recv().await {
        if !is_content_change(&event) || !event.paths.iter().any(|p| p == config_path) {
            continue;
        }

        info!("Configuration file changed, reloading upstream registries");
        reload_registries(config_path, client);
    }

    error!("Config watcher channel closed");
}

fn reload_registries(config_path: &Path, client: &RegistryClient) {
    let config = match Configuration::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            error!("Failed to reload configuration: {error}");
            return;
        }
    };

    match client.update_registries(&config.registry) {
        Ok(()) => info!("Reloaded {} upstream registries", config.registry.len()),
        Err(error) => error!("Failed to apply upstream registry configuration: {error}"),
    }
}
