//! Bringing a tenant to its desired agent version
//!
//! The tenant row is pinned to the target version *before* the install
//! starts, so a concurrent GC pass always sees an in-flight install as
//! protected.

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::events::{EventRecorder, LifecycleEvent, LifecycleKind};
use crate::installer::{Installer, InstallerKind};
use crate::metadata::{tenant_id_from_api_url, MetadataStore, Tenant};
use crate::paths::PathResolver;
use crate::version::VersionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// File in the tenant config dir naming the active agent
pub const TENANT_CONFIG_FILE: &str = "agent.json";

/// Which managed resource wants an agent, and where its tenant lives
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub owner_name: String,
    pub api_url: String,
}

/// Result of a successful provision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub tenant_id: String,
    pub version: VersionId,
    pub freshly_installed: bool,
    pub binary_dir: PathBuf,
}

/// Contents of `tenants/<id>/config/agent.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantAgentConfig {
    pub tenant_id: String,
    pub owner_name: String,
    pub version: VersionId,
    pub installer: InstallerKind,
    pub binary_dir: PathBuf,
    pub updated_at: DateTime<Utc>,
}

pub struct Provisioner {
    store: Arc<dyn MetadataStore>,
    paths: PathResolver,
    events: Arc<dyn EventRecorder>,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        paths: PathResolver,
        events: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            store,
            paths,
            events,
        }
    }

    /// Resolve, pin, install, and publish the tenant config view
    ///
    /// `installer.cleanup()` runs whether or not this succeeds.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
        installer: &dyn Installer,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<Provisioned> {
        let result = self.run(request, installer, cancel).await;
        installer.cleanup().await;
        result
    }

    async fn run(
        &self,
        request: &ProvisionRequest,
        installer: &dyn Installer,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<Provisioned> {
        let tenant_id = tenant_id_from_api_url(&request.api_url)?;

        if cancel.is_cancelled() {
            return Err(AgentCacheError::Cancelled);
        }
        let version = installer.resolve_version(cancel).await?;
        debug!(
            "Tenant {} ({}) targets version {}",
            tenant_id, request.owner_name, version
        );

        let tenant = Tenant::new(&tenant_id, &request.owner_name).with_version(version.clone());
        self.store.upsert_tenant(&tenant).await?;

        let outcome = match installer.install(&version, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !matches!(e, AgentCacheError::Cancelled) {
                    self.record(&tenant, &version, LifecycleKind::InstallFailed, Some(e.to_string()))
                        .await;
                }
                return Err(e);
            }
        };

        let kind = if outcome.freshly_installed {
            LifecycleKind::Installed
        } else {
            LifecycleKind::AlreadyPresent
        };
        self.record(&tenant, &version, kind, None).await;

        let binary_dir = self.paths.shared_binary_dir(&version);
        self.write_tenant_config(&tenant, &version, installer.kind(), &binary_dir)
            .await?;

        info!(
            "Tenant {} uses agent {} ({})",
            tenant_id,
            version,
            kind.as_str()
        );

        Ok(Provisioned {
            tenant_id,
            version,
            freshly_installed: outcome.freshly_installed,
            binary_dir,
        })
    }

    async fn record(
        &self,
        tenant: &Tenant,
        version: &VersionId,
        kind: LifecycleKind,
        reason: Option<String>,
    ) {
        if let Some(reason) = &reason {
            warn!("Install for {} failed: {}", tenant.owner_name, reason);
        }
        self.events
            .record(LifecycleEvent {
                kind,
                owner_name: tenant.owner_name.clone(),
                tenant_id: tenant.tenant_id.clone(),
                version: version.to_string(),
                reason,
            })
            .await;
    }

    /// Write-then-rename so readers never see a truncated file
    async fn write_tenant_config(
        &self,
        tenant: &Tenant,
        version: &VersionId,
        installer: InstallerKind,
        binary_dir: &std::path::Path,
    ) -> AgentCacheResult<()> {
        let dir = self.paths.tenant_config_dir(&tenant.tenant_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AgentCacheError::filesystem(&dir, e))?;

        let config = TenantAgentConfig {
            tenant_id: tenant.tenant_id.clone(),
            owner_name: tenant.owner_name.clone(),
            version: version.clone(),
            installer,
            binary_dir: binary_dir.to_path_buf(),
            updated_at: Utc::now(),
        };

        let path = dir.join(TENANT_CONFIG_FILE);
        let tmp = dir.join(format!(".{}.tmp", TENANT_CONFIG_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&config)?)
            .await
            .map_err(|e| AgentCacheError::filesystem(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| AgentCacheError::filesystem(&path, e))
    }
}

/// Read the tenant config view written by the last provision
pub async fn read_tenant_config(
    paths: &PathResolver,
    tenant_id: &str,
) -> AgentCacheResult<Option<TenantAgentConfig>> {
    let path = paths.tenant_config_dir(tenant_id).join(TENANT_CONFIG_FILE);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(AgentCacheError::filesystem(path, e)),
    }
}
