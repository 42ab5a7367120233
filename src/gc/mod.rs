//! Garbage collection of agent binaries and stale volume rows
//!
//! A shared binary directory is retained iff its version is *used* (some
//! volume row references it) or *pinned* (a tenant's desired version, or
//! held by config). Everything else under the shared root is removed.
//!
//! The binary sweeps are best-effort: a failing sweep does not stop the
//! phases after it, and its error is returned once they have run. The
//! stale-volume sweep stops at the first error.

mod binaries;
mod volumes;

pub use volumes::VolumeScope;

use crate::cluster::ClusterApi;
use crate::error::{AgentCacheError, AgentCacheResult};
use crate::metadata::{MetadataStore, Tenant};
use crate::paths::PathResolver;
use crate::version::VersionSet;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default `gc.max_unmounted_volume_age`
pub const DEFAULT_MAX_UNMOUNTED_VOLUME_AGE: Duration = Duration::from_secs(10 * 60);

/// Staging entries older than this belong to installs that died
pub const STAGING_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// What a GC pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub removed_versions: Vec<String>,
    pub removed_tenant_binaries: Vec<String>,
    pub removed_volumes: Vec<String>,
    pub removed_staging: usize,
    /// The managed resource was gone, nothing was done
    pub skipped: bool,
    /// Cancellation stopped the pass before all phases ran
    pub cancelled: bool,
}

impl GcReport {
    pub fn total_removed(&self) -> usize {
        self.removed_versions.len()
            + self.removed_tenant_binaries.len()
            + self.removed_volumes.len()
            + self.removed_staging
    }
}

pub struct GarbageCollector {
    store: Arc<dyn MetadataStore>,
    cluster: Arc<dyn ClusterApi>,
    paths: PathResolver,
    max_unmounted_age: Duration,
    config_pins: VersionSet,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        cluster: Arc<dyn ClusterApi>,
        paths: PathResolver,
    ) -> Self {
        Self {
            store,
            cluster,
            paths,
            max_unmounted_age: DEFAULT_MAX_UNMOUNTED_VOLUME_AGE,
            config_pins: VersionSet::new(),
        }
    }

    pub fn with_max_unmounted_age(mut self, age: Duration) -> Self {
        self.max_unmounted_age = age;
        self
    }

    /// Versions kept regardless of tenant state
    pub fn with_config_pins(mut self, pins: VersionSet) -> Self {
        self.config_pins = pins;
        self
    }

    /// Tenant desired versions plus config-held pins
    pub async fn pinned_versions(&self) -> AgentCacheResult<VersionSet> {
        let tenant_versions = self.store.tenant_versions().await?;
        Ok(tenant_versions.union(&self.config_pins))
    }

    /// GC triggered by a reconcile of one managed resource
    ///
    /// Runs the tenant's deprecated-binary sweep, the stale-volume sweep for
    /// its volumes, then the node-wide shared sweep.
    pub async fn reconcile(
        &self,
        owner_name: &str,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<GcReport> {
        let mut report = GcReport::default();

        if !self.cluster.managed_resource_exists(owner_name).await? {
            debug!("{} no longer exists, skipping GC", owner_name);
            report.skipped = true;
            return Ok(report);
        }

        let tenant = self.store.get_tenant_by_owner(owner_name).await?;
        let mut first_error = None;

        if let Some(tenant) = &tenant {
            if cancelled(cancel, &mut report) {
                return Ok(report);
            }
            match self.sweep_tenant_binaries(tenant).await {
                Ok(removed) => report.removed_tenant_binaries = removed,
                Err(e) => {
                    warn!("Tenant binary sweep for {} failed: {}", tenant.tenant_id, e);
                    first_error = Some(e);
                }
            }

            if cancelled(cancel, &mut report) {
                return surface(report, first_error);
            }
            report.removed_volumes = self
                .sweep_stale_volumes(&VolumeScope::Tenant(tenant.tenant_id.clone()), Utc::now())
                .await?
                .into_iter()
                .map(|v| v.volume_id)
                .collect();
        }

        self.finish_with_shared_sweep(report, first_error, cancel).await
    }

    /// Node-wide GC: every stale volume, then the shared sweep
    pub async fn collect_all(&self, cancel: &CancellationToken) -> AgentCacheResult<GcReport> {
        let mut report = GcReport::default();

        if cancelled(cancel, &mut report) {
            return Ok(report);
        }
        report.removed_volumes = self
            .sweep_stale_volumes(&VolumeScope::All, Utc::now())
            .await?
            .into_iter()
            .map(|v| v.volume_id)
            .collect();

        self.finish_with_shared_sweep(report, None, cancel).await
    }

    /// Shared and staging sweeps; an earlier best-effort error is
    /// returned once both have run
    async fn finish_with_shared_sweep(
        &self,
        mut report: GcReport,
        mut first_error: Option<AgentCacheError>,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<GcReport> {
        if cancelled(cancel, &mut report) {
            return surface(report, first_error);
        }
        match self.sweep_shared_binaries().await {
            Ok(removed) => report.removed_versions = removed,
            Err(e) => {
                warn!("Shared binary sweep failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        if cancelled(cancel, &mut report) {
            return surface(report, first_error);
        }
        match binaries::remove_stale_staging(&self.paths.staging_root(), STAGING_MAX_AGE).await {
            Ok(removed) => report.removed_staging = removed,
            Err(e) => {
                warn!("Staging sweep failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        info!(
            "GC removed {} version(s), {} tenant binary dir(s), {} volume(s), {} staging entr(ies)",
            report.removed_versions.len(),
            report.removed_tenant_binaries.len(),
            report.removed_volumes.len(),
            report.removed_staging
        );
        surface(report, first_error)
    }

    /// Remove shared binary directories that are neither used nor pinned
    ///
    /// The directory is listed before the protected set is read: a version
    /// that appears on disk was pinned before its install began, so it is
    /// already in the set by the time the set is computed.
    pub async fn sweep_shared_binaries(&self) -> AgentCacheResult<Vec<String>> {
        let dirs = binaries::list_subdirs(&self.paths.shared_binary_root()).await?;
        if dirs.is_empty() {
            return Ok(vec![]);
        }

        let used = self.store.used_versions().await?;
        let protected = used.union(&self.pinned_versions().await?);
        debug!(
            "Shared sweep: {} on disk, {} protected",
            dirs.len(),
            protected.len()
        );

        binaries::remove_unprotected(dirs, &protected).await
    }

    /// Remove a tenant's pre-migration binaries other than its latest version
    pub async fn sweep_tenant_binaries(&self, tenant: &Tenant) -> AgentCacheResult<Vec<String>> {
        let root = self.paths.deprecated_agent_binary_root(&tenant.tenant_id);
        let dirs = binaries::list_subdirs(&root).await?;
        if dirs.is_empty() {
            return Ok(vec![]);
        }

        let mut protected = self.store.used_versions().await?;
        protected.extend(tenant.latest_version.clone());

        binaries::remove_unprotected(dirs, &protected).await
    }

    /// Remove volume rows whose pod is gone and which are older than the limit
    pub async fn sweep_stale_volumes(
        &self,
        scope: &VolumeScope,
        now: DateTime<Utc>,
    ) -> AgentCacheResult<Vec<crate::metadata::Volume>> {
        let max_age = chrono::Duration::from_std(self.max_unmounted_age)
            .map_err(|e| AgentCacheError::Internal(format!("volume age out of range: {}", e)))?;
        volumes::sweep(
            self.store.as_ref(),
            self.cluster.as_ref(),
            scope,
            max_age,
            now,
        )
        .await
    }
}

fn surface(report: GcReport, first_error: Option<AgentCacheError>) -> AgentCacheResult<GcReport> {
    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

fn cancelled(cancel: &CancellationToken, report: &mut GcReport) -> bool {
    if cancel.is_cancelled() {
        info!("GC pass cancelled");
        report.cancelled = true;
    }
    report.cancelled
}
