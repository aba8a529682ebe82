use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod error;
pub mod watcher;

pub use error::Error;

pub const DOCKER_HUB: &str = "docker.io";
pub const DOCKER_HUB_ENDPOINT: &str = "registry-1.docker.io";

#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    pub server: ServerConfig,
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    #[serde(default)]
    pub registry: Vec<RegistryConfig>,
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_query_timeout")]
    pub query_timeout: u64,
    #[serde(default = "ServerConfig::default_query_timeout_grace_period")]
    pub query_timeout_grace_period: u64,
    pub tls: Option<ServerTlsConfig>,
}

impl ServerConfig {
    fn default_port() -> u16 {
        8080
    }

    fn default_query_timeout() -> u64 {
        3600
    }

    fn default_query_timeout_grace_period() -> u64 {
        60
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerTlsConfig {
    pub server_certificate_bundle: String,
    pub server_private_key: String,
    pub client_ca_bundle: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "GlobalConfig::default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            max_concurrent_requests: GlobalConfig::default_max_concurrent_requests(),
        }
    }
}

impl GlobalConfig {
    fn default_max_concurrent_requests() -> usize {
        4
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_image_path")]
    pub image_path: PathBuf,
    /// Seconds a request waits on another request's in-flight pull.
    #[serde(default = "CacheConfig::default_pull_timeout")]
    pub pull_timeout: u64,
    #[serde(default)]
    pub always_pull_latest: bool,
    #[serde(default)]
    pub air_gapped: bool,
    #[serde(default = "CacheConfig::default_upstream")]
    pub default_upstream: String,
    #[serde(default)]
    pub sync_to_disk: bool,
    pub preload_images: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            image_path: CacheConfig::default_image_path(),
            pull_timeout: CacheConfig::default_pull_timeout(),
            always_pull_latest: false,
            air_gapped: false,
            default_upstream: CacheConfig::default_upstream(),
            sync_to_disk: false,
            preload_images: None,
        }
    }
}

impl CacheConfig {
    fn default_image_path() -> PathBuf {
        PathBuf::from("/var/lib/pullthrough-registry")
    }

    fn default_pull_timeout() -> u64 {
        60
    }

    fn default_upstream() -> String {
        DOCKER_HUB.to_string()
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_timeout)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub enum PruneKind {
    #[default]
    #[serde(rename = "accessed")]
    Accessed,
    #[serde(rename = "created")]
    Created,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PruneConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kind: PruneKind,
    #[serde(default = "PruneConfig::default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "PruneConfig::default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for PruneConfig {
    fn default() -> Self {
        PruneConfig {
            enabled: false,
            kind: PruneKind::default(),
            max_age_days: PruneConfig::default_max_age_days(),
            interval: PruneConfig::default_interval(),
            dry_run: false,
        }
    }
}

impl PruneConfig {
    fn default_max_age_days() -> u32 {
        30
    }

    fn default_interval() -> u64 {
        3600
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub enum Scheme {
    #[serde(rename = "http")]
    Http,
    #[default]
    #[serde(rename = "https")]
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Options for one upstream registry, keyed by the host name used in image
/// references.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RegistryConfig {
    pub name: String,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default = "RegistryConfig::default_os")]
    pub os: String,
    #[serde(default = "RegistryConfig::default_arch")]
    pub arch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub server_ca_bundle: Option<String>,
    pub client_certificate: Option<String>,
    pub client_private_key: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl RegistryConfig {
    fn default_os() -> String {
        "linux".to_string()
    }

    fn default_arch() -> String {
        "amd64".to_string()
    }

    /// Options used for a registry that has no `[[registry]]` entry.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: None,
            scheme: Scheme::default(),
            os: Self::default_os(),
            arch: Self::default_arch(),
            username: None,
            password: None,
            token: None,
            server_ca_bundle: None,
            client_certificate: None,
            client_private_key: None,
            insecure_skip_verify: false,
        }
    }

    /// Host and port actually contacted.
    pub fn endpoint(&self) -> &str {
        match &self.endpoint {
            Some(endpoint) => endpoint,
            None if self.name == DOCKER_HUB => DOCKER_HUB_ENDPOINT,
            None => &self.name,
        }
    }

    pub fn has_custom_tls(&self) -> bool {
        self.server_ca_bundle.is_some()
            || self.client_certificate.is_some()
            || self.client_private_key.is_some()
            || self.insecure_skip_verify
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TracingConfig {
    pub endpoint: String,
    pub sampling_rate: f64,
}

impl Configuration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_str = fs::read_to_string(path)?;
        Self::load_from_str(&config_str)
    }

    pub fn load_from_str(slice: &str) -> Result<Self, Error> {
        let config: Configuration = toml::from_str(slice).map_err(|e| {
            println!("Configuration file format error:");
            println!("{e}");
            Error::ConfigurationFileFormat(e.to_string())
        })?;

        if config.global.max_concurrent_requests == 0 {
            return Err(Error::ConfigurationFileFormat(
                "max_concurrent_requests must be at least 1".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for registry in &config.registry {
            if !names.insert(registry.name.as_str()) {
                return Err(Error::ConfigurationFileFormat(format!(
                    "Duplicate registry entry: {}",
                    registry.name
                )));
            }
        }

        Ok(config)
    }

    /// Per-registry options for `host`, falling back to defaults.
    pub fn registry_config(&self, host: &str) -> RegistryConfig {
        self.registry
            .iter()
            .find(|registry| registry.name == host)
            .cloned()
            .unwrap_or_else(|| RegistryConfig::new(host))
    }
}
