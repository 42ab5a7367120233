//! Configuration management for agent-cache

pub mod schema;

pub use schema::Config;

use crate::error::{AgentCacheError, AgentCacheResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Overrides `[storage].data_dir`
pub const DATA_DIR_ENV: &str = "CSI_DATA_DIR";

/// Overrides `[gc].max_unmounted_volume_age`
pub const MAX_UNMOUNTED_VOLUME_AGE_ENV: &str = "MAX_UNMOUNTED_VOLUME_AGE";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        PathBuf::from("/etc/agent-cache/config.toml")
    }

    /// Load configuration, falling back to defaults, then apply env overrides
    pub async fn load(&self) -> AgentCacheResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        validate(&config, &self.config_path)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> AgentCacheResult<Config> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            AgentCacheError::io(format!("reading config from {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| AgentCacheError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = lookup(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        debug!("{} overrides data_dir: {}", DATA_DIR_ENV, dir);
        config.storage.data_dir = PathBuf::from(dir);
    }
    if let Some(age) = lookup(MAX_UNMOUNTED_VOLUME_AGE_ENV).filter(|v| !v.is_empty()) {
        debug!("{} overrides max_unmounted_volume_age: {}", MAX_UNMOUNTED_VOLUME_AGE_ENV, age);
        config.gc.max_unmounted_volume_age = age;
    }
}

fn validate(config: &Config, path: &Path) -> AgentCacheResult<()> {
    let invalid = |reason: String| AgentCacheError::ConfigInvalid {
        path: path.to_path_buf(),
        reason,
    };

    config
        .gc
        .max_unmounted_volume_age()
        .map_err(|e| invalid(e.to_string()))?;
    config
        .gc
        .pinned_versions()
        .map_err(|e| invalid(e.to_string()))?;
    if !matches!(config.general.log_format.as_str(), "text" | "json") {
        return Err(invalid(format!(
            "general.log_format must be \"text\" or \"json\", got {:?}",
            config.general.log_format
        )));
    }
    Ok(())
}
