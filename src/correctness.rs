//! Startup repair of metadata against live cluster state
//!
//! Crashes, missed unpublish calls and resources deleted while the node
//! was down leave rows behind. The checker removes them in three ordered
//! steps and aborts at the first failure; unlike GC, a partial pass is an
//! error, because startup must not proceed on unrepaired metadata.

use crate::cluster::ClusterApi;
use crate::error::{AgentCacheError, AgentCacheResult};
use crate::metadata::MetadataStore;
use crate::paths::PathResolver;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Rows removed by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrectionReport {
    /// `(volume_id, pod_name)`
    pub pruned_volumes: Vec<(String, String)>,
    /// `(tenant_id, owner_name)` whose managed resource is gone
    pub pruned_tenants: Vec<(String, String)>,
    /// `(tenant_id, owner_name)` still on the per-tenant binary layout
    pub migrated_tenants: Vec<(String, String)>,
    pub remaining_tenants: usize,
    pub remaining_volumes: usize,
}

impl CorrectionReport {
    pub fn total_pruned(&self) -> usize {
        self.pruned_volumes.len() + self.pruned_tenants.len() + self.migrated_tenants.len()
    }
}

pub struct CorrectnessChecker {
    store: Arc<dyn MetadataStore>,
    cluster: Arc<dyn ClusterApi>,
    paths: PathResolver,
}

impl CorrectnessChecker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cluster: Arc<dyn ClusterApi>,
        paths: PathResolver,
    ) -> Self {
        Self {
            store,
            cluster,
            paths,
        }
    }

    /// Run all repairs in order
    pub async fn correct(&self, cancel: &CancellationToken) -> AgentCacheResult<CorrectionReport> {
        let mut report = CorrectionReport::default();

        check_cancel(cancel)?;
        report.pruned_volumes = self.remove_volumes_without_pods().await?;
        log_pruned("volume|pod", &report.pruned_volumes);

        check_cancel(cancel)?;
        report.pruned_tenants = self.remove_tenants_without_resource().await?;
        log_pruned("tenant|owner", &report.pruned_tenants);

        check_cancel(cancel)?;
        report.migrated_tenants = self.remove_tenants_on_deprecated_layout().await?;
        log_pruned("tenant|owner", &report.migrated_tenants);

        report.remaining_tenants = self.store.all_tenants().await?.len();
        report.remaining_volumes = self.store.all_volumes().await?.len();
        info!(
            "Metadata after correction: {} tenant(s), {} volume(s)",
            report.remaining_tenants, report.remaining_volumes
        );

        Ok(report)
    }

    async fn remove_volumes_without_pods(&self) -> AgentCacheResult<Vec<(String, String)>> {
        let mut pods: Vec<_> = self.store.pod_names_to_volume_ids().await?.into_iter().collect();
        pods.sort();

        let mut pruned = Vec::new();
        for (pod, volume_ids) in pods {
            if self.cluster.pod_exists(&pod).await? {
                continue;
            }
            for volume_id in volume_ids {
                self.store.delete_volume(&volume_id).await?;
                pruned.push((volume_id, pod.clone()));
            }
        }
        Ok(pruned)
    }

    async fn remove_tenants_without_resource(&self) -> AgentCacheResult<Vec<(String, String)>> {
        let mut pruned = Vec::new();
        for tenant in self.store.all_tenants().await? {
            if self.cluster.managed_resource_exists(&tenant.owner_name).await? {
                continue;
            }
            self.store.delete_tenant(&tenant.tenant_id).await?;
            pruned.push((tenant.tenant_id, tenant.owner_name));
        }
        Ok(pruned)
    }

    /// A tenant whose desired version only exists at `tenants/<id>/bin/<v>`
    /// predates shared binaries; dropping the row makes the next reconcile
    /// install into the shared root.
    async fn remove_tenants_on_deprecated_layout(&self) -> AgentCacheResult<Vec<(String, String)>> {
        let mut pruned = Vec::new();
        for tenant in self.store.all_tenants().await? {
            let Some(version) = &tenant.latest_version else {
                continue;
            };
            let deprecated = self
                .paths
                .deprecated_agent_binary_dir(&tenant.tenant_id, version);
            let exists = tokio::fs::try_exists(&deprecated)
                .await
                .map_err(|e| AgentCacheError::filesystem(&deprecated, e))?;
            if !exists {
                continue;
            }

            self.store.delete_tenant(&tenant.tenant_id).await?;
            pruned.push((tenant.tenant_id, tenant.owner_name));
        }
        Ok(pruned)
    }
}

fn check_cancel(cancel: &CancellationToken) -> AgentCacheResult<()> {
    if cancel.is_cancelled() {
        Err(AgentCacheError::Cancelled)
    } else {
        Ok(())
    }
}

fn log_pruned(label: &str, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        return;
    }
    let rendered: Vec<String> = pairs.iter().map(|(a, b)| format!("{}|{}", a, b)).collect();
    info!("Pruned {} ({}): {}", label, pairs.len(), rendered.join(", "));
}
