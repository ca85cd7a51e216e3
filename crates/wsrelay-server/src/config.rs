//! Server configuration: TOML file, then CLI overrides, then the routing map
//! from the environment.

use crate::handler::FanoutPolicy;
use crate::routes::RoutingMap;
use crate::store::StoreBackend;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;
use wsrelay_core::{RelayError, RelayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub delivery: DeliverySection,
    #[serde(default)]
    pub invoke: InvokeSection,
    #[serde(default)]
    pub routes: HashMap<String, String>,
}

/// `[server]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Seconds between consistency sweeps; 0 disables.
    #[serde(default)]
    pub sweep_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            backend_port: default_backend_port(),
            domain: default_domain(),
            stage: default_stage(),
            sweep_interval: 0,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

/// `[delivery]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    #[serde(default)]
    pub fanout: FanoutPolicy,
    #[serde(default = "default_true")]
    pub prune_stale: bool,
    #[serde(default = "default_scheme")]
    pub endpoint_scheme: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            fanout: FanoutPolicy::default(),
            prune_stale: true,
            endpoint_scheme: default_scheme(),
            auth_token: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// `[invoke]` section. Without a `base_url`, requests cannot be dispatched.
#[derive(Debug, Clone, Deserialize)]
pub struct InvokeSection {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for InvokeSection {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_timeout(),
        }
    }
}

fn default_port() -> u16 {
    4430
}
fn default_backend_port() -> u16 {
    4431
}
fn default_domain() -> String {
    "localhost".to_string()
}
fn default_stage() -> String {
    "local".to_string()
}
fn default_store_path() -> String {
    "~/.wsrelay/store".to_string()
}
fn default_scheme() -> String {
    "https".to_string()
}
fn default_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub backend_port: Option<u16>,
    pub store_backend: Option<StoreBackend>,
    pub store_path: Option<String>,
    pub invoke_url: Option<String>,
    pub fanout: Option<FanoutPolicy>,
    pub sweep_interval: Option<u64>,
}

/// Resolved configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub backend_port: u16,
    pub domain: String,
    pub stage: String,
    pub sweep_interval: u64,
    pub store_backend: StoreBackend,
    pub store_path: PathBuf,
    pub fanout: FanoutPolicy,
    pub prune_stale: bool,
    pub endpoint_scheme: String,
    pub auth_token: Option<String>,
    pub delivery_timeout_secs: u64,
    pub invoke_url: Option<String>,
    pub invoke_timeout_secs: u64,
    pub routes: RoutingMap,
}

impl ServerConfig {
    /// Load config from TOML file, apply CLI overrides, then let
    /// `WSRELAY_ROUTES` replace the `[routes]` table if it is set.
    pub fn load(config_path: Option<&Path>, overrides: Overrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        RelayError::Other(format!("cannot read {}: {e}", expanded.display()))
                    })?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut config = Self::resolve(file_config, overrides);
        if let Some(routes) = RoutingMap::from_env()? {
            config.routes = routes;
        }
        Ok(config)
    }

    /// Merge a parsed file with overrides. Does not read the environment.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Self {
        let store_path = overrides.store_path.unwrap_or(file.store.path);
        Self {
            port: overrides.port.unwrap_or(file.server.port),
            backend_port: overrides.backend_port.unwrap_or(file.server.backend_port),
            domain: file.server.domain,
            stage: file.server.stage,
            sweep_interval: overrides.sweep_interval.unwrap_or(file.server.sweep_interval),
            store_backend: overrides.store_backend.unwrap_or(file.store.backend),
            store_path: expand_tilde_str(&store_path),
            fanout: overrides.fanout.unwrap_or(file.delivery.fanout),
            prune_stale: file.delivery.prune_stale,
            endpoint_scheme: file.delivery.endpoint_scheme,
            auth_token: file.delivery.auth_token,
            delivery_timeout_secs: file.delivery.timeout_secs,
            invoke_url: overrides.invoke_url.or(file.invoke.base_url),
            invoke_timeout_secs: file.invoke.timeout_secs,
            routes: file.routes.into_iter().collect(),
        }
    }
}

/// Parse config TOML.
pub fn parse(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str(content).map_err(|e| RelayError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
