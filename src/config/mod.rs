//! Configuration module

use crate::statistic::{
    MAX_ACTIVE_TCP_CONNECTION, MAX_ACTIVE_UDP_CONNECTION, MAX_CONNECTION_HISTORY, STORE_FILE,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Base directory for relative paths
    #[serde(rename = "home-dir")]
    pub home_dir: PathBuf,

    /// Connection statistics
    pub statistic: StatisticConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            home_dir: PathBuf::from("."),
            statistic: StatisticConfig::default(),
        }
    }
}

/// Connection statistics configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StatisticConfig {
    /// Maximum concurrently open TCP connections
    pub max_tcp_connections: u64,
    /// Maximum concurrently open UDP connections
    pub max_udp_connections: u64,
    /// Number of closed and open connections kept in history
    pub history_size: usize,
    /// Persist aggregate counters across restarts
    pub persistence: bool,
    /// Counter file, relative to `home-dir` unless absolute
    pub store_path: PathBuf,
}

impl Default for StatisticConfig {
    fn default() -> Self {
        StatisticConfig {
            max_tcp_connections: MAX_ACTIVE_TCP_CONNECTION,
            max_udp_connections: MAX_ACTIVE_UDP_CONNECTION,
            history_size: MAX_CONNECTION_HISTORY,
            persistence: true,
            store_path: PathBuf::from(STORE_FILE),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.statistic.history_size == 0 {
            return Err(Error::config("statistic.history-size must be greater than 0"));
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "warning" | "error" | "silent" => {}
            other => return Err(Error::config(format!("Unknown log level: {}", other))),
        }

        Ok(())
    }

    /// Resolve a path against the home directory
    pub fn resolve<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home_dir.join(path)
        }
    }

    /// Location of the persisted counter file
    pub fn store_path(&self) -> PathBuf {
        self.resolve(&self.statistic.store_path)
    }
}
