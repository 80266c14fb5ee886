//! Hub configuration file (`multicam.toml`).
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:6789"
//!
//! [storage]
//! path = "multicam_data"      # omit for a volatile in-memory store
//!
//! [device]
//! visca_port = 52381
//! command_timeout_ms = 3000
//! max_attempts = 3
//!
//! [tally]
//! host = "10.0.0.2"
//! port = 9800
//!
//! [[cameras]]
//! address = "10.0.0.10"
//! tally_id = 1
//!
//! [[cameras]]
//! address = "10.0.0.11"       # no tally_id: tally stays unknown
//! ```

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::device::RetryPolicy;
use crate::hub::HubOptions;
use crate::server::ServerConfig;
use crate::storage::StoreConfig;
use crate::tally::Backoff;

/// Default configuration file name
pub const CONFIG_FILE_NAME: &str = "multicam.toml";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("camera {camera}: invalid address {address:?}")]
    InvalidAddress { camera: usize, address: String },
    #[error("camera {camera} has a tally_id but no [tally] source is configured")]
    MissingTallySource { camera: usize },
    #[error("{0}")]
    Invalid(String),
}

/// Complete hub configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub hub: HubOptions,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    pub tally: Option<TallyConfig>,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// RocksDB directory; `None` keeps presets in memory only
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
}

fn default_sync_writes() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_writes: default_sync_writes(),
        }
    }
}

impl StorageConfig {
    pub fn store_config(&self) -> Option<StoreConfig> {
        self.path.as_ref().map(|path| StoreConfig {
            path: path.clone(),
            sync_writes: self.sync_writes,
            ..StoreConfig::default()
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_visca_port")]
    pub visca_port: u16,
    /// Time allowed for one attempt of a camera command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_visca_port() -> u16 {
    crate::device::visca::DEFAULT_PORT
}

fn default_command_timeout_ms() -> u64 {
    3000
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            visca_port: default_visca_port(),
            command_timeout_ms: default_command_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl DeviceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.command_timeout_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Where tally feeds subscribe.
#[derive(Debug, Clone, Deserialize)]
pub struct TallyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl TallyConfig {
    /// `host:port` of the tally server.
    pub fn source(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// IP address, optionally with a port
    pub address: String,
    /// Tally subscription id; cameras without one get no feed
    #[serde(default)]
    pub tally_id: Option<u32>,
}

impl CameraConfig {
    /// VISCA endpoint, using `default_port` when the address has none.
    pub fn socket_addr(&self, default_port: u16) -> Option<SocketAddr> {
        self.address.parse::<SocketAddr>().ok().or_else(|| {
            self.address
                .parse::<IpAddr>()
                .ok()
                .map(|ip| SocketAddr::new(ip, default_port))
        })
    }
}

impl HubConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }
        for (camera, cam) in self.cameras.iter().enumerate() {
            if cam.socket_addr(self.device.visca_port).is_none() {
                return Err(ConfigError::InvalidAddress {
                    camera,
                    address: cam.address.clone(),
                });
            }
            if cam.tally_id.is_some() && self.tally.is_none() {
                return Err(ConfigError::MissingTallySource { camera });
            }
        }
        if self.device.max_attempts == 0 {
            return Err(ConfigError::Invalid("device.max_attempts must be at least 1".into()));
        }
        if self.device.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("device.command_timeout_ms must be positive".into()));
        }
        if self.hub.session_buffer == 0 {
            return Err(ConfigError::Invalid("hub.session_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
