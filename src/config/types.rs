//! Configuration types.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::ConfigError;

/// Broker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to a mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Ensure the database directory exists.
    pub fn ensure_db_dir(&self) -> Result<(), ConfigError> {
        if let Some(parent) = self.server.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

/// Server-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("task-broker/broker.db")
}

/// Timeout reclamation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between reclaim sweeps. Zero disables the job.
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            reclaim_interval_secs: default_reclaim_interval(),
        }
    }
}

impl MaintenanceConfig {
    pub fn reclaim_interval(&self) -> Option<Duration> {
        (self.reclaim_interval_secs > 0).then(|| Duration::from_secs(self.reclaim_interval_secs))
    }
}

fn default_reclaim_interval() -> u64 {
    60
}

/// Monitoring snapshot job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Seconds between snapshots. Zero disables the job.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,

    /// How long snapshots are kept, in seconds.
    #[serde(default = "default_history")]
    pub history_secs: i64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval(),
            history_secs: default_history(),
        }
    }
}

impl MonitoringConfig {
    pub fn snapshot_interval(&self) -> Option<Duration> {
        (self.snapshot_interval_secs > 0).then(|| Duration::from_secs(self.snapshot_interval_secs))
    }
}

fn default_snapshot_interval() -> u64 {
    120
}

fn default_history() -> i64 {
    7 * 24 * 3600 // one week
}
