//! Versioned archive downloads from the tenant API

use crate::config::schema::InstallerConfig;
use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::staging::{install_atomically, unpack_tar};
use crate::installer::{http_agent, InstallOutcome, Installer, InstallerKind};
use crate::paths::PathResolver;
use crate::version::VersionId;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Downloads a `tar.gz` of a fixed agent version
pub struct UrlInstaller {
    version: VersionId,
    url: String,
    api_token: Option<String>,
    agent: ureq::Agent,
    paths: PathResolver,
}

impl UrlInstaller {
    pub fn new(
        api_url: &str,
        version: VersionId,
        config: &InstallerConfig,
        paths: PathResolver,
    ) -> AgentCacheResult<Self> {
        let url = download_url(&config.url_template, api_url, &version);
        Ok(Self {
            version,
            url,
            api_token: config.api_token.clone(),
            agent: http_agent(config)?,
            paths,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn download_url(template: &str, api_url: &str, version: &VersionId) -> String {
    template
        .replace("{api_url}", api_url.trim_end_matches('/'))
        .replace("{version}", version.as_str())
}

#[async_trait]
impl Installer for UrlInstaller {
    async fn resolve_version(&self, _cancel: &CancellationToken) -> AgentCacheResult<VersionId> {
        Ok(self.version.clone())
    }

    async fn install(
        &self,
        target: &VersionId,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<InstallOutcome> {
        if target != &self.version {
            return Err(AgentCacheError::install(
                target.as_str(),
                format!("installer is configured for version {}", self.version),
            ));
        }

        let agent = self.agent.clone();
        let url = self.url.clone();
        let token = self.api_token.clone();
        let version = target.clone();

        install_atomically(&self.paths, target, InstallerKind::Url, cancel, move |dest, cancel| {
            info!("Downloading agent {} from {}", version, url);

            let mut request = agent.get(&url);
            if let Some(token) = &token {
                request = request.header("Authorization", &format!("Api-Token {}", token));
            }
            let response = request
                .call()
                .map_err(|e| AgentCacheError::install(version.as_str(), e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AgentCacheError::install(
                    version.as_str(),
                    format!("GET {} returned {}", url, status.as_u16()),
                ));
            }

            if cancel.is_cancelled() {
                return Err(AgentCacheError::Cancelled);
            }

            // Stream straight from the socket through gunzip into the staging dir
            let reader = response.into_body().into_reader();
            let unpacked = unpack_tar(GzDecoder::new(reader), dest)
                .map_err(|e| AgentCacheError::install(version.as_str(), e.to_string()))?;
            debug!("Unpacked {} entries for {}", unpacked, version);
            Ok(())
        })
        .await
    }

    async fn cleanup(&self) {
        // Nothing outlives install(): the archive is never written to disk
    }

    fn kind(&self) -> InstallerKind {
        InstallerKind::Url
    }
}
