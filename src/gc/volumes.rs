//! Stale volume rows
//!
//! A volume is stale when its pod is gone and it was mounted longer ago
//! than the configured age. Young volumes are kept even without a pod, so
//! that a pod that is still starting up is not pruned under it.

use crate::cluster::ClusterApi;
use crate::error::AgentCacheResult;
use crate::metadata::{MetadataStore, Volume};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Which volumes a sweep considers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeScope {
    All,
    Tenant(String),
}

/// Delete stale volume rows; stops at the first error
pub(crate) async fn sweep(
    store: &dyn MetadataStore,
    cluster: &dyn ClusterApi,
    scope: &VolumeScope,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> AgentCacheResult<Vec<Volume>> {
    let volumes = match scope {
        VolumeScope::All => store.all_volumes().await?,
        VolumeScope::Tenant(tenant_id) => store.volumes_for_tenant(tenant_id).await?,
    };

    let mut removed = Vec::new();
    for volume in volumes {
        if !volume.is_older_than(max_age, now) {
            continue;
        }
        if cluster.pod_exists(&volume.pod_name).await? {
            continue;
        }

        store.delete_volume(&volume.volume_id).await?;
        info!(
            "Removed stale volume {} (pod {} gone, mounted {})",
            volume.volume_id,
            volume.pod_name,
            volume.mounted_at.to_rfc3339()
        );
        removed.push(volume);
    }

    debug!("Stale volume sweep removed {}", removed.len());
    Ok(removed)
}
