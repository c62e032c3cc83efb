//! Gateway configuration types and loading.

use holdfast_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration for the gateway process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Network binding configuration
    pub network: NetworkConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Worker pool configuration
    pub runtime: RuntimeConfig,
}

/// Network configuration for client connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind for client connections
    pub bind_address: SocketAddr,

    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

/// Storage configuration for entity persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory for the durable entity tables
    pub data_dir: PathBuf,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads for inbound payload processing
    pub worker_threads: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7440".parse().expect("valid default address"),
            max_connections: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("./data") }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: num_cpus::get() }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file, then apply
    /// `HOLDFAST_*` environment overrides.
    ///
    /// # Errors
    /// Returns a configuration error when the file cannot be read or
    /// parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                let config = toml::from_str(&text).map_err(|e| Error::Configuration {
                    message: format!("failed to parse {}: {e}", path.display()),
                })?;
                info!("loaded configuration file: {}", path.display());
                config
            },
            None => Self::default(),
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply `HOLDFAST_*` environment variable overrides in place.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("HOLDFAST_BIND_ADDRESS") {
            match value.parse() {
                Ok(addr) => self.network.bind_address = addr,
                Err(e) => warn!(value = %value, error = %e, "ignoring invalid HOLDFAST_BIND_ADDRESS"),
            }
        }
        if let Ok(value) = std::env::var("HOLDFAST_MAX_CONNECTIONS") {
            match value.parse() {
                Ok(max) => self.network.max_connections = max,
                Err(e) => warn!(value = %value, error = %e, "ignoring invalid HOLDFAST_MAX_CONNECTIONS"),
            }
        }
        if let Ok(value) = std::env::var("HOLDFAST_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("HOLDFAST_WORKER_THREADS") {
            match value.parse() {
                Ok(threads) => self.runtime.worker_threads = threads,
                Err(e) => warn!(value = %value, error = %e, "ignoring invalid HOLDFAST_WORKER_THREADS"),
            }
        }
    }
}
