//! Broker configuration.
//!
//! The first configuration file found wins, in this order:
//! 1. **Explicit** - `--config` or `TASK_BROKER_CONFIG_PATH`
//! 2. **Project** - `$CWD/task-broker/config.yaml`
//! 3. **User** - `~/.task-broker/config.yaml`
//!
//! Built-in defaults fill every missing field.
//!
//! ## Environment Variables
//! Applied after the file is loaded:
//! - `TASK_BROKER_DB_PATH` - Database path
//! - `TASK_BROKER_RECLAIM_INTERVAL` - Seconds between timeout reclaim sweeps
//! - `TASK_BROKER_SNAPSHOT_INTERVAL` - Seconds between monitoring snapshots
//! - `TASK_BROKER_MONITORING_HISTORY` - Snapshot retention in seconds

mod loader;
mod types;

pub use loader::{apply_env_overrides, ConfigLoader, ConfigPaths, ConfigTier};
pub use types::*;

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file (or directory) could not be read or created.
    #[error("cannot access config path {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration YAML.
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// An environment override could not be parsed.
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}
