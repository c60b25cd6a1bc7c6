//! Configuration discovery and environment overrides.

use super::types::Config;
use super::ConfigError;
use std::path::PathBuf;
use tracing::debug;

/// Where a configuration was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    /// Built-in defaults (lowest priority)
    Defaults = 0,
    /// User-level config (~/.task-broker/)
    User = 1,
    /// Project-level config ($CWD/task-broker/)
    Project = 2,
    /// Explicit `--config` or `TASK_BROKER_CONFIG_PATH`
    Explicit = 3,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::Explicit => write!(f, "explicit"),
        }
    }
}

/// Candidate config file locations.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    pub explicit: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Discover locations from the CLI flag, environment and home directory.
    pub fn discover(explicit: Option<PathBuf>) -> Self {
        let explicit = explicit.or_else(|| std::env::var("TASK_BROKER_CONFIG_PATH").ok().map(PathBuf::from));

        Self {
            explicit,
            project_dir: Some(PathBuf::from("task-broker")),
            user_dir: dirs::home_dir().map(|h| h.join(".task-broker")),
        }
    }

    /// Candidate files, highest priority first.
    fn candidates(&self) -> Vec<(ConfigTier, PathBuf)> {
        let mut candidates = Vec::new();
        if let Some(ref dir) = self.project_dir {
            candidates.push((ConfigTier::Project, dir.join("config.yaml")));
        }
        if let Some(ref dir) = self.user_dir {
            candidates.push((ConfigTier::User, dir.join("config.yaml")));
        }
        candidates
    }
}

/// Loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config: Config,
    tier: ConfigTier,
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Discover and load configuration, then apply environment overrides.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut loader = Self::load_with_paths(&ConfigPaths::discover(explicit))?;
        apply_env_overrides(&mut loader.config, |key| std::env::var(key).ok())?;
        Ok(loader)
    }

    /// Load from explicit paths without consulting the environment.
    ///
    /// An explicit path must exist; other tiers are optional and the first
    /// file found wins.
    pub fn load_with_paths(paths: &ConfigPaths) -> Result<Self, ConfigError> {
        if let Some(ref path) = paths.explicit {
            return Ok(Self {
                config: Config::load(path)?,
                tier: ConfigTier::Explicit,
                config_path: Some(path.clone()),
            });
        }

        for (tier, path) in paths.candidates() {
            if path.exists() {
                debug!(path = %path.display(), %tier, "loading config");
                return Ok(Self {
                    config: Config::load(&path)?,
                    tier,
                    config_path: Some(path),
                });
            }
        }

        Ok(Self {
            config: Config::default(),
            tier: ConfigTier::Defaults,
            config_path: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn tier(&self) -> ConfigTier {
        self.tier
    }

    pub fn config_path(&self) -> Option<&PathBuf> {
        self.config_path.as_ref()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Apply `TASK_BROKER_*` overrides read through `lookup`.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(db_path) = lookup("TASK_BROKER_DB_PATH") {
        config.server.db_path = PathBuf::from(db_path);
    }

    if let Some(value) = lookup("TASK_BROKER_RECLAIM_INTERVAL") {
        config.maintenance.reclaim_interval_secs = parse_var("TASK_BROKER_RECLAIM_INTERVAL", &value)?;
    }

    if let Some(value) = lookup("TASK_BROKER_SNAPSHOT_INTERVAL") {
        config.monitoring.snapshot_interval_secs = parse_var("TASK_BROKER_SNAPSHOT_INTERVAL", &value)?;
    }

    if let Some(value) = lookup("TASK_BROKER_MONITORING_HISTORY") {
        config.monitoring.history_secs = parse_var("TASK_BROKER_MONITORING_HISTORY", &value)?;
    }

    Ok(())
}
