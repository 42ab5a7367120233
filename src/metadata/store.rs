//! Metadata store abstraction
//!
//! Every component receives the store as an injected `Arc<dyn MetadataStore>`
//! rather than reaching for a process-wide handle.

use crate::error::AgentCacheResult;
use crate::metadata::models::{Tenant, Volume};
use crate::version::VersionSet;
use async_trait::async_trait;
use std::collections::HashMap;

/// Durable record of tenants and volumes on this node
///
/// Each operation is atomic with respect to the rows it touches. Deletes are
/// idempotent: removing an absent row succeeds.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or replace the tenant row, keyed by tenant ID
    ///
    /// A previous row for the same owner under a different tenant ID is
    /// replaced in the same transaction.
    async fn upsert_tenant(&self, tenant: &Tenant) -> AgentCacheResult<()>;

    async fn get_tenant(&self, tenant_id: &str) -> AgentCacheResult<Option<Tenant>>;

    async fn get_tenant_by_owner(&self, owner_name: &str) -> AgentCacheResult<Option<Tenant>>;

    async fn delete_tenant(&self, tenant_id: &str) -> AgentCacheResult<()>;

    /// Snapshot of all tenants, read in one transaction
    async fn all_tenants(&self) -> AgentCacheResult<Vec<Tenant>>;

    /// Every resolved `latest_version` across tenants
    async fn tenant_versions(&self) -> AgentCacheResult<VersionSet>;

    /// Record a new volume; fails with `VolumeConflict` if the ID exists
    async fn create_volume(&self, volume: &Volume) -> AgentCacheResult<()>;

    async fn get_volume(&self, volume_id: &str) -> AgentCacheResult<Option<Volume>>;

    async fn delete_volume(&self, volume_id: &str) -> AgentCacheResult<()>;

    async fn all_volumes(&self) -> AgentCacheResult<Vec<Volume>>;

    async fn volumes_for_tenant(&self, tenant_id: &str) -> AgentCacheResult<Vec<Volume>>;

    /// Versions referenced by at least one volume
    async fn used_versions(&self) -> AgentCacheResult<VersionSet>;

    /// Pod name to the IDs of its volumes, for the pod-liveness join
    async fn pod_names_to_volume_ids(&self) -> AgentCacheResult<HashMap<String, Vec<String>>>;
}
