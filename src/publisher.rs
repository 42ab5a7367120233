//! Volume records for CSI publish and unpublish

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::staging::is_complete;
use crate::metadata::{MetadataStore, Volume};
use crate::paths::PathResolver;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct VolumePublisher {
    store: Arc<dyn MetadataStore>,
    paths: PathResolver,
}

impl VolumePublisher {
    pub fn new(store: Arc<dyn MetadataStore>, paths: PathResolver) -> Self {
        Self { store, paths }
    }

    /// Record `volume_id` for `pod_name` against the owner's installed version
    ///
    /// Returns the shared binary directory to bind-mount. A retried publish of
    /// the same volume for the same pod and version succeeds again.
    pub async fn publish(
        &self,
        volume_id: &str,
        pod_name: &str,
        owner_name: &str,
    ) -> AgentCacheResult<PathBuf> {
        let tenant = self
            .store
            .get_tenant_by_owner(owner_name)
            .await?
            .ok_or_else(|| AgentCacheError::TenantNotFound(owner_name.to_string()))?;

        let not_installed = |version: &str| AgentCacheError::VersionNotInstalled {
            tenant: tenant.tenant_id.clone(),
            version: version.to_string(),
        };

        let version = tenant
            .latest_version
            .clone()
            .ok_or_else(|| not_installed("<unresolved>"))?;

        let binary_dir = self.paths.shared_binary_dir(&version);
        if !is_complete(&binary_dir) {
            return Err(not_installed(version.as_str()));
        }

        let volume = Volume::new(volume_id, pod_name, &tenant.tenant_id, version);
        match self.store.create_volume(&volume).await {
            Ok(()) => {
                info!(
                    "Published volume {} for pod {} ({} @ {})",
                    volume_id, pod_name, tenant.tenant_id, volume.version
                );
                Ok(binary_dir)
            }
            Err(AgentCacheError::VolumeConflict(id)) => {
                match self.store.get_volume(volume_id).await? {
                    Some(existing) if existing.same_mount(&volume) => {
                        debug!("Volume {} already published", volume_id);
                        Ok(binary_dir)
                    }
                    _ => Err(AgentCacheError::VolumeConflict(id)),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the volume record; absent volumes are not an error
    pub async fn unpublish(&self, volume_id: &str) -> AgentCacheResult<Option<Volume>> {
        let existing = self.store.get_volume(volume_id).await?;
        self.store.delete_volume(volume_id).await?;
        match &existing {
            Some(v) => info!("Unpublished volume {} (pod {})", v.volume_id, v.pod_name),
            None => debug!("Volume {} was not recorded", volume_id),
        }
        Ok(existing)
    }
}
