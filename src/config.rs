//! Command line and configuration file.
//!
//! Every field has a default, so a missing file or a partial file is valid.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::collector::{PoolSettings, SshSettings};
use crate::monitor::MonitorSettings;
use crate::proxy::{BreakerSettings, ForwarderSettings};

#[derive(Parser, Debug)]
#[command(name = "cluster-edge", version, about = "Self-hosted cluster edge proxy")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cluster-edge.toml", env = "CLUSTER_EDGE_CONFIG")]
    pub config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EdgeConfig {
    pub proxy: ProxyConfig,
    pub health: HealthConfig,
    pub monitor: MonitorConfig,
    pub collector: CollectorConfig,
    pub breaker: BreakerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub listen: SocketAddr,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub membership_file: PathBuf,
    pub success_interval_ms: u64,
    pub error_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            membership_file: PathBuf::from("cluster-setup.json"),
            success_interval_ms: 1000,
            error_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    pub ssh_port: u16,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub max_sessions_per_host: usize,
    pub idle_timeout_secs: u64,
    pub strict_host_keys: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            ssh_port: 22,
            connect_timeout_secs: 5,
            command_timeout_secs: 15,
            max_sessions_per_host: 4,
            idle_timeout_secs: 120,
            strict_host_keys: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub snapshot_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("data"),
        }
    }
}

impl EdgeConfig {
    /// Loads and validates the file at `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&shown, &text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %shown, "config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: shown,
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: &str, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.collector.max_sessions_per_host == 0 {
            return Err(ConfigError::Invalid(
                "collector.max_sessions_per_host must be at least 1".to_string(),
            ));
        }
        let durations = [
            ("proxy.request_timeout_secs", self.proxy.request_timeout_secs),
            ("proxy.connect_timeout_secs", self.proxy.connect_timeout_secs),
            ("monitor.success_interval_ms", self.monitor.success_interval_ms),
            ("monitor.error_interval_secs", self.monitor.error_interval_secs),
            ("collector.connect_timeout_secs", self.collector.connect_timeout_secs),
            ("collector.command_timeout_secs", self.collector.command_timeout_secs),
            ("collector.idle_timeout_secs", self.collector.idle_timeout_secs),
            ("breaker.reset_timeout_secs", self.breaker.reset_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        Ok(())
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.proxy.connect_timeout_secs),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.breaker.reset_timeout_secs),
        }
    }

    pub fn ssh_settings(&self) -> SshSettings {
        SshSettings {
            port: self.collector.ssh_port,
            connect_timeout: Duration::from_secs(self.collector.connect_timeout_secs),
            command_timeout: Duration::from_secs(self.collector.command_timeout_secs),
            strict_host_keys: self.collector.strict_host_keys,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_per_host: self.collector.max_sessions_per_host,
            idle_timeout: Duration::from_secs(self.collector.idle_timeout_secs),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            membership_file: self.monitor.membership_file.clone(),
            success_interval: Duration::from_millis(self.monitor.success_interval_ms),
            error_interval: Duration::from_secs(self.monitor.error_interval_secs),
        }
    }
}
