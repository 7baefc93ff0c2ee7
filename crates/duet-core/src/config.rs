//! Configuration system for duet
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/duet/config.toml
//! - Linux: ~/.config/duet/config.toml
//! - Windows: %APPDATA%/duet/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffer::DEFAULT_MAX_MESSAGE_BYTES;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay server settings
    pub signal: SignalConfig,
    /// Call client settings
    pub client: ClientConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Listen port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Idle I/O timeout in seconds
    pub io_timeout_secs: u64,
    /// Ceiling on unconsumed inbound bytes per connection
    pub max_message_bytes: usize,
    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,
    /// Serve wss:// using `cert_file` and `pkey_file`
    pub ssl: bool,
    /// PEM certificate chain, leaf first
    pub cert_file: Option<PathBuf>,
    /// PEM private key (PKCS#8) for the leaf certificate
    pub pkey_file: Option<PathBuf>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            io_timeout_secs: 30,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_connections: 0,
            ssl: false,
            cert_file: None,
            pkey_file: None,
        }
    }
}

impl SignalConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Call client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay host
    pub host: String,
    /// Relay port
    pub port: u16,
    /// Request path on the relay
    pub path: String,
    /// Use TLS (wss://)
    pub ssl: bool,
    /// Timeout for opening the connection, in seconds
    pub io_timeout_secs: u64,
    /// Ceiling on unconsumed inbound bytes
    pub max_message_bytes: usize,
    /// Connection attempts before giving up
    pub connect_attempts: u32,
    /// Delay between connection attempts (ms)
    pub connect_backoff_ms: u64,
    /// Call retries while the target is offline
    pub call_attempts: u32,
    /// Delay between call retries (ms)
    pub call_backoff_ms: u64,
    /// Give up if no call is established within this many seconds
    pub call_setup_timeout_secs: u64,
    /// How often the call-setup timeout is checked (ms)
    pub liveness_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/".into(),
            ssl: false,
            io_timeout_secs: 10,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            connect_attempts: 3,
            connect_backoff_ms: 1000,
            call_attempts: 5,
            call_backoff_ms: 2000,
            call_setup_timeout_secs: 30,
            liveness_interval_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// WebSocket URL of the relay
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn call_backoff(&self) -> Duration {
        Duration::from_millis(self.call_backoff_ms)
    }

    pub fn call_setup_timeout(&self) -> Duration {
        Duration::from_secs(self.call_setup_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "duet", "duet").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
