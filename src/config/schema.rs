//! Configuration schema for agent-cache
//!
//! Configuration is stored at `/etc/agent-cache/config.toml`

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::version::{VersionId, VersionSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// On-disk layout
    pub storage: StorageConfig,

    /// Garbage collection settings
    pub gc: GcConfig,

    /// Cluster lookup settings
    pub cluster: ClusterConfig,

    /// Agent download settings
    pub installer: InstallerConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the CSI data directory
    pub data_dir: PathBuf,

    /// Lifecycle event log (JSON lines), relative paths resolve under data_dir
    pub event_log: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            event_log: PathBuf::from("events.log"),
        }
    }
}

impl StorageConfig {
    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.event_log)
    }
}

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How long a volume whose pod is gone is kept, e.g. "10m", "6h", "7d"
    pub max_unmounted_volume_age: String,

    /// Versions that are never collected, regardless of tenant state
    pub pinned_versions: Vec<String>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_unmounted_volume_age: "10m".to_string(),
            pinned_versions: vec![],
        }
    }
}

impl GcConfig {
    /// Parsed stale-volume threshold
    pub fn max_unmounted_volume_age(&self) -> AgentCacheResult<Duration> {
        parse_duration(&self.max_unmounted_volume_age)
    }

    /// Parsed config-held pins
    pub fn pinned_versions(&self) -> AgentCacheResult<VersionSet> {
        self.pinned_versions
            .iter()
            .map(|v| VersionId::parse(v))
            .collect()
    }
}

/// Cluster lookup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// kubectl binary
    pub kubectl: String,

    /// Namespace of the managed resources
    pub namespace: String,

    /// Resource type of the managed resources
    pub resource: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            namespace: "dynatrace".to_string(),
            resource: "dynakubes.dynatrace.com".to_string(),
        }
    }
}

/// Agent download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// HTTP(S) proxy for registry and download traffic
    pub proxy: Option<String>,

    /// Overall timeout per HTTP request, in seconds
    pub timeout_secs: u64,

    /// Docker config.json holding registry credentials
    pub docker_config: Option<PathBuf>,

    /// Download URL for versioned archives; `{api_url}` and `{version}` are substituted
    pub url_template: String,

    /// Token sent as `Authorization: Api-Token <token>` on archive downloads
    pub api_token: Option<String>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            timeout_secs: 300,
            docker_config: None,
            url_template: "{api_url}/v1/deployment/installer/agent/unix/paas/version/{version}"
                .to_string(),
            api_token: None,
        }
    }
}

/// Parse a duration such as `90s`, `10m`, `6h` or `7d`
///
/// A bare integer is a number of days.
pub fn parse_duration(value: &str) -> AgentCacheResult<Duration> {
    let trimmed = value.trim();
    let invalid = |reason: &str| AgentCacheError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }

    let (digits, unit_secs) = match trimmed.char_indices().last() {
        Some((idx, 's')) => (&trimmed[..idx], 1),
        Some((idx, 'm')) => (&trimmed[..idx], 60),
        Some((idx, 'h')) => (&trimmed[..idx], 60 * 60),
        Some((idx, 'd')) => (&trimmed[..idx], 24 * 60 * 60),
        _ => (trimmed, 24 * 60 * 60),
    };

    let amount: u64 = digits
        .parse()
        .map_err(|_| invalid("expected a whole number with optional s/m/h/d suffix"))?;

    amount
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| invalid("too large"))
}
