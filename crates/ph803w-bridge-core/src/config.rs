//! Bridge configuration.
//!
//! Loaded from a camelCase JSON document; every field has a default so an
//! empty object is a valid configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default UDP port PH803W devices answer discovery probes on
pub const DEFAULT_DISCOVERY_PORT: u16 = 12414;

/// What to do with a discovery notification that carries no device id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingIdPolicy {
    /// Drop it and wait for the next notification
    #[default]
    Ignore,
    /// Derive a stable id from the device address
    Synthesize,
}

impl MissingIdPolicy {
    /// Synthetic id for a device known only by its address.
    pub fn synthetic_id(ip: &str) -> String {
        let slug: String = ip
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        format!("ph803w-{}", slug)
    }
}

/// UDP discovery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Address probes are sent to
    pub target: String,
    /// Local port to bind (0 picks an ephemeral port)
    pub bind_port: u16,
    pub probe_interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: format!("255.255.255.255:{}", DEFAULT_DISCOVERY_PORT),
            bind_port: 0,
            probe_interval_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    pub fn target_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.target.parse().map_err(|_| ConfigError::InvalidField {
            field: "discovery.target".to_string(),
            reason: format!("'{}' is not a socket address", self.target),
        })
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub missing_id: MissingIdPolicy,
    /// Upper bound for each destroy request during shutdown
    pub shutdown_timeout_ms: u64,
    /// Directory for persisted known devices
    pub data_dir: Option<PathBuf>,
    pub log_filter: String,
    pub discovery: DiscoveryConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            missing_id: MissingIdPolicy::Ignore,
            shutdown_timeout_ms: 5000,
            data_dir: None,
            log_filter: "info".to_string(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::InvalidField {
                field: "shutdownTimeoutMs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        if self.discovery.enabled {
            if self.discovery.probe_interval_ms == 0 {
                return Err(ConfigError::InvalidField {
                    field: "discovery.probeIntervalMs".to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
            self.discovery.target_addr()?;
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Directory for persisted state, falling back to the platform data dir.
    pub fn resolved_data_dir(&self) -> Option<PathBuf> {
        self.data_dir
            .clone()
            .or_else(crate::storage::default_data_dir)
    }
}
