//! Error types for agent-cache
//!
//! All modules use `AgentCacheResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for agent-cache operations
pub type AgentCacheResult<T> = Result<T, AgentCacheError>;

/// All errors that can occur in agent-cache
#[derive(Error, Debug)]
pub enum AgentCacheError {
    // Metadata store errors
    #[error("Metadata store error: {0}")]
    Store(String),

    #[error("Volume already exists: {0}")]
    VolumeConflict(String),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    // Input validation errors
    #[error("Invalid version identifier {value:?}: {reason}")]
    InvalidVersion { value: String, reason: String },

    #[error("Invalid API URL {url}: {reason}")]
    InvalidApiUrl { url: String, reason: String },

    #[error("Invalid image reference {reference}: {reason}")]
    InvalidImageReference { reference: String, reason: String },

    // Install errors
    #[error("Install of {version} failed: {reason}")]
    Install { version: String, reason: String },

    #[error("Agent version {version} is not installed for tenant {tenant}")]
    VersionNotInstalled { tenant: String, version: String },

    // Filesystem errors (GC and layout maintenance)
    #[error("Filesystem error at {path}: {source}")]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Cluster errors
    #[error("Cluster lookup failed: {0}")]
    Cluster(String),

    #[error("Required CLI not found: {name}. {hint}")]
    CliNotFound { name: String, hint: String },

    #[error("Operation cancelled")]
    Cancelled,

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid duration {value:?}: {reason}")]
    InvalidDuration { value: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for AgentCacheError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl AgentCacheError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a filesystem error for a path
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Create an install error for a version
    pub fn install(version: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Install {
            version: version.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error only signals absence of a row
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::TenantNotFound(_) | Self::VolumeNotFound(_))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Store(_)
                | Self::VolumeConflict(_)
                | Self::Install { .. }
                | Self::Cluster(_)
                | Self::Filesystem { .. }
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::CliNotFound { .. } => Some("Install kubectl or set [cluster].kubectl in the config"),
            Self::ConfigInvalid { .. } => Some("Run: agent-cache config show"),
            Self::VersionNotInstalled { .. } => {
                Some("Run: agent-cache install --tenant <owner> before publishing volumes")
            }
            Self::InvalidApiUrl { .. } => {
                Some("Expected https://<tenant>.<domain>/api or https://<host>/e/<tenant>/api")
            }
            _ => None,
        }
    }
}
