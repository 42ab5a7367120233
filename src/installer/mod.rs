//! Agent installers
//!
//! An installer resolves which version it is going to produce and then
//! materializes it under `shared/<version>`. Two strategies exist: a
//! versioned archive download from the tenant API (`url`) and an OCI image
//! pulled from a registry (`image`). Both commit through
//! [`staging::install_atomically`].

pub mod image;
pub mod registry;
pub mod staging;
pub mod url;

pub use image::{ImageInstaller, ImageReference};
pub use url::UrlInstaller;

use crate::config::schema::InstallerConfig;
use crate::error::{AgentCacheError, AgentCacheResult};
use crate::paths::PathResolver;
use crate::version::VersionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Which strategy produced an install
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    Url,
    Image,
}

impl fmt::Display for InstallerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url => write!(f, "url"),
            Self::Image => write!(f, "image"),
        }
    }
}

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub version: VersionId,
    /// False when the version was already present (or a racer won)
    pub freshly_installed: bool,
}

impl InstallOutcome {
    pub fn fresh(version: VersionId) -> Self {
        Self {
            version,
            freshly_installed: true,
        }
    }

    pub fn existing(version: VersionId) -> Self {
        Self {
            version,
            freshly_installed: false,
        }
    }
}

/// Strategy for materializing an agent version
#[async_trait]
pub trait Installer: Send + Sync {
    /// The version `install` will produce, known before any bytes are written
    async fn resolve_version(&self, cancel: &CancellationToken) -> AgentCacheResult<VersionId>;

    /// Materialize `target` under the shared root
    async fn install(
        &self,
        target: &VersionId,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<InstallOutcome>;

    /// Release transient resources; called on every exit path
    async fn cleanup(&self);

    fn kind(&self) -> InstallerKind;
}

/// Where a tenant's agent comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    /// Versioned archive from the tenant API
    Url { version: String },
    /// OCI image reference
    Image { reference: String },
}

impl InstallSource {
    /// Build the installer for this source
    pub fn build(
        &self,
        api_url: &str,
        config: &InstallerConfig,
        paths: &PathResolver,
    ) -> AgentCacheResult<Box<dyn Installer>> {
        Ok(match self {
            Self::Url { version } => Box::new(UrlInstaller::new(
                api_url,
                VersionId::parse(version)?,
                config,
                paths.clone(),
            )?),
            Self::Image { reference } => Box::new(ImageInstaller::new(
                ImageReference::parse(reference)?,
                config,
                paths.clone(),
            )?),
        })
    }
}

/// HTTP agent shared by both installers
///
/// Status codes are not turned into errors so that registry auth challenges
/// can be inspected.
pub(crate) fn http_agent(config: &InstallerConfig) -> AgentCacheResult<ureq::Agent> {
    let proxy = match config.proxy.as_deref().filter(|p| !p.is_empty()) {
        Some(url) => Some(ureq::Proxy::new(url).map_err(|e| AgentCacheError::ConfigInvalid {
            path: "installer.proxy".into(),
            reason: e.to_string(),
        })?),
        None => None,
    };

    let agent_config = ureq::Agent::config_builder()
        .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
        .http_status_as_error(false)
        .proxy(proxy)
        .build();

    Ok(agent_config.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn installer_kind_display() {
        assert_eq!(InstallerKind::Url.to_string(), "url");
        assert_eq!(
            serde_json::to_string(&InstallerKind::Image).unwrap(),
            "\"image\""
        );
    }

    #[test]
    fn build_rejects_bad_inputs() {
        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path());
        let config = InstallerConfig::default();

        let bad_version = InstallSource::Url {
            version: "../up".to_string(),
        };
        assert!(bad_version
            .build("https://t1.live.example.com/api", &config, &paths)
            .is_err());

        let bad_image = InstallSource::Image {
            reference: "".to_string(),
        };
        assert!(bad_image
            .build("https://t1.live.example.com/api", &config, &paths)
            .is_err());
    }

    #[test]
    fn build_picks_strategy() {
        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path());
        let config = InstallerConfig::default();

        let url = InstallSource::Url {
            version: "1.2.3".to_string(),
        }
        .build("https://t1.live.example.com/api", &config, &paths)
        .unwrap();
        assert_eq!(url.kind(), InstallerKind::Url);

        let image = InstallSource::Image {
            reference: "registry.example.com/agent:1.2.3".to_string(),
        }
        .build("https://t1.live.example.com/api", &config, &paths)
        .unwrap();
        assert_eq!(image.kind(), InstallerKind::Image);
    }

    #[test]
    fn invalid_proxy_is_config_error() {
        let config = InstallerConfig {
            proxy: Some("::not a url::".to_string()),
            ..InstallerConfig::default()
        };
        assert!(matches!(
            http_agent(&config),
            Err(AgentCacheError::ConfigInvalid { .. })
        ));
    }
}
