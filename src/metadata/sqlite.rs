//! SQLite-backed metadata store

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::metadata::models::{Tenant, Volume};
use crate::metadata::store::MetadataStore;
use crate::version::{VersionId, VersionSet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata store over a single SQLite connection
///
/// The connection is shared behind a mutex and all queries run on tokio's
/// blocking pool. Writes use immediate transactions so two writers touching
/// one row are serialized by SQLite itself.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: &Path) -> AgentCacheResult<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AgentCacheError::io(format!("creating metadata directory {}", parent.display()), e)
            })?;
        }

        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> AgentCacheResult<Connection> {
            let mut conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            init_schema(&mut conn)?;
            debug!("Opened metadata store at {}", path.display());
            Ok(conn)
        })
        .await
        .map_err(|e| AgentCacheError::Internal(format!("store open task failed: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory store, used by tests and dry runs
    pub fn open_in_memory() -> AgentCacheResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        init_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> AgentCacheResult<T>
    where
        F: FnOnce(&mut Connection) -> AgentCacheResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AgentCacheError::Store("connection mutex poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| AgentCacheError::Internal(format!("store task failed: {}", e)))?
    }
}

fn init_schema(conn: &mut Connection) -> AgentCacheResult<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS tenants (
            tenant_id TEXT PRIMARY KEY,
            owner_name TEXT NOT NULL UNIQUE,
            latest_version TEXT
        );
        CREATE TABLE IF NOT EXISTS volumes (
            volume_id TEXT PRIMARY KEY,
            pod_name TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            version TEXT NOT NULL,
            mounted_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_volumes_tenant ON volumes (tenant_id);
        CREATE INDEX IF NOT EXISTS idx_volumes_version ON volumes (version);
        "#,
    )?;

    let version: Option<i64> = tx
        .query_row("SELECT version FROM schema_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO schema_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(AgentCacheError::Store(format!(
                "unsupported metadata schema version {} (expected {})",
                other, SCHEMA_VERSION
            )));
        }
    }

    tx.commit()?;
    Ok(())
}

/// Raw tenant columns, validated after the query finishes
struct TenantRow {
    tenant_id: String,
    owner_name: String,
    latest_version: Option<String>,
}

impl TenantRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            tenant_id: row.get(0)?,
            owner_name: row.get(1)?,
            latest_version: row.get(2)?,
        })
    }

    fn into_tenant(self) -> AgentCacheResult<Tenant> {
        let latest_version = match self.latest_version.as_deref() {
            None | Some("") => None,
            Some(v) => Some(stored_version(v)?),
        };
        Ok(Tenant {
            tenant_id: self.tenant_id,
            owner_name: self.owner_name,
            latest_version,
        })
    }
}

struct VolumeRow {
    volume_id: String,
    pod_name: String,
    tenant_id: String,
    version: String,
    mounted_at: String,
}

impl VolumeRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            volume_id: row.get(0)?,
            pod_name: row.get(1)?,
            tenant_id: row.get(2)?,
            version: row.get(3)?,
            mounted_at: row.get(4)?,
        })
    }

    fn into_volume(self) -> AgentCacheResult<Volume> {
        let mounted_at = DateTime::parse_from_rfc3339(&self.mounted_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                AgentCacheError::Store(format!(
                    "volume {} has invalid mount timestamp {:?}: {}",
                    self.volume_id, self.mounted_at, e
                ))
            })?;
        Ok(Volume {
            version: stored_version(&self.version)?,
            volume_id: self.volume_id,
            pod_name: self.pod_name,
            tenant_id: self.tenant_id,
            mounted_at,
        })
    }
}

fn stored_version(value: &str) -> AgentCacheResult<VersionId> {
    VersionId::parse(value)
        .map_err(|e| AgentCacheError::Store(format!("corrupt version column: {}", e)))
}

const TENANT_COLUMNS: &str = "tenant_id, owner_name, latest_version";
const VOLUME_COLUMNS: &str = "volume_id, pod_name, tenant_id, version, mounted_at";

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> AgentCacheResult<()> {
        let tenant = tenant.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "DELETE FROM tenants WHERE owner_name = ?1 AND tenant_id != ?2",
                params![tenant.owner_name, tenant.tenant_id],
            )?;
            tx.execute(
                "INSERT INTO tenants (tenant_id, owner_name, latest_version) VALUES (?1, ?2, ?3)
                 ON CONFLICT(tenant_id) DO UPDATE SET
                    owner_name = excluded.owner_name,
                    latest_version = excluded.latest_version",
                params![
                    tenant.tenant_id,
                    tenant.owner_name,
                    tenant.latest_version.as_ref().map(VersionId::as_str)
                ],
            )?;
            tx.commit()?;
            debug!(
                "Upserted tenant {} ({}) at version {:?}",
                tenant.tenant_id, tenant.owner_name, tenant.latest_version
            );
            Ok(())
        })
        .await
    }

    async fn get_tenant(&self, tenant_id: &str) -> AgentCacheResult<Option<Tenant>> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM tenants WHERE tenant_id = ?1", TENANT_COLUMNS),
                    params![tenant_id],
                    TenantRow::from_row,
                )
                .optional()?;
            row.map(TenantRow::into_tenant).transpose()
        })
        .await
    }

    async fn get_tenant_by_owner(&self, owner_name: &str) -> AgentCacheResult<Option<Tenant>> {
        let owner_name = owner_name.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM tenants WHERE owner_name = ?1", TENANT_COLUMNS),
                    params![owner_name],
                    TenantRow::from_row,
                )
                .optional()?;
            row.map(TenantRow::into_tenant).transpose()
        })
        .await
    }

    async fn delete_tenant(&self, tenant_id: &str) -> AgentCacheResult<()> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM tenants WHERE tenant_id = ?1", params![tenant_id])?;
            if deleted == 0 {
                debug!("Tenant {} already absent", tenant_id);
            }
            Ok(())
        })
        .await
    }

    async fn all_tenants(&self) -> AgentCacheResult<Vec<Tenant>> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let rows = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM tenants ORDER BY owner_name",
                    TENANT_COLUMNS
                ))?;
                let rows = stmt
                    .query_map([], TenantRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            tx.commit()?;
            rows.into_iter().map(TenantRow::into_tenant).collect()
        })
        .await
    }

    async fn tenant_versions(&self) -> AgentCacheResult<VersionSet> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT latest_version FROM tenants
                 WHERE latest_version IS NOT NULL AND latest_version != ''",
            )?;
            let versions = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            versions.iter().map(|v| stored_version(v)).collect()
        })
        .await
    }

    async fn create_volume(&self, volume: &Volume) -> AgentCacheResult<()> {
        let volume = volume.clone();
        self.with_conn(move |conn| {
            let result = conn.execute(
                "INSERT INTO volumes (volume_id, pod_name, tenant_id, version, mounted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    volume.volume_id,
                    volume.pod_name,
                    volume.tenant_id,
                    volume.version.as_str(),
                    volume.mounted_at.to_rfc3339()
                ],
            );
            match result {
                Ok(_) => {
                    debug!(
                        "Created volume {} for pod {} at version {}",
                        volume.volume_id, volume.pod_name, volume.version
                    );
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    Err(AgentCacheError::VolumeConflict(volume.volume_id))
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn get_volume(&self, volume_id: &str) -> AgentCacheResult<Option<Volume>> {
        let volume_id = volume_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM volumes WHERE volume_id = ?1", VOLUME_COLUMNS),
                    params![volume_id],
                    VolumeRow::from_row,
                )
                .optional()?;
            row.map(VolumeRow::into_volume).transpose()
        })
        .await
    }

    async fn delete_volume(&self, volume_id: &str) -> AgentCacheResult<()> {
        let volume_id = volume_id.to_string();
        self.with_conn(move |conn| {
            let deleted = conn.execute("DELETE FROM volumes WHERE volume_id = ?1", params![volume_id])?;
            if deleted == 0 {
                debug!("Volume {} already absent", volume_id);
            }
            Ok(())
        })
        .await
    }

    async fn all_volumes(&self) -> AgentCacheResult<Vec<Volume>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM volumes ORDER BY mounted_at",
                VOLUME_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], VolumeRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(VolumeRow::into_volume).collect()
        })
        .await
    }

    async fn volumes_for_tenant(&self, tenant_id: &str) -> AgentCacheResult<Vec<Volume>> {
        let tenant_id = tenant_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM volumes WHERE tenant_id = ?1 ORDER BY mounted_at",
                VOLUME_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![tenant_id], VolumeRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(VolumeRow::into_volume).collect()
        })
        .await
    }

    async fn used_versions(&self) -> AgentCacheResult<VersionSet> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT version FROM volumes")?;
            let versions = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            versions.iter().map(|v| stored_version(v)).collect()
        })
        .await
    }

    async fn pod_names_to_volume_ids(&self) -> AgentCacheResult<HashMap<String, Vec<String>>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT pod_name, volume_id FROM volumes ORDER BY volume_id")?;
            let pairs = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut by_pod: HashMap<String, Vec<String>> = HashMap::new();
            for (pod, volume) in pairs {
                by_pod.entry(pod).or_default().push(volume);
            }
            Ok(by_pod)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn v(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn tenant_upsert_and_lookup() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tenant = Tenant::new("t1", "dk-a").with_version(v("1.0"));

        store.upsert_tenant(&tenant).await.unwrap();
        assert_eq!(store.get_tenant("t1").await.unwrap(), Some(tenant.clone()));
        assert_eq!(store.get_tenant_by_owner("dk-a").await.unwrap(), Some(tenant));

        let updated = Tenant::new("t1", "dk-a").with_version(v("2.0"));
        store.upsert_tenant(&updated).await.unwrap();
        assert_eq!(store.all_tenants().await.unwrap(), vec![updated]);
    }

    #[tokio::test]
    async fn all_tenants_sorted_by_owner() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (id, owner) in [("t3", "dk-c"), ("t1", "dk-a"), ("t2", "dk-b")] {
            store.upsert_tenant(&Tenant::new(id, owner)).await.unwrap();
        }

        let owners: Vec<_> = store
            .all_tenants()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.owner_name)
            .collect();
        assert_eq!(owners, vec!["dk-a", "dk-b", "dk-c"]);
    }

    #[tokio::test]
    async fn owner_moving_to_new_tenant_replaces_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_tenant(&Tenant::new("t1", "dk-a")).await.unwrap();
        store.upsert_tenant(&Tenant::new("t2", "dk-a")).await.unwrap();

        let tenants = store.all_tenants().await.unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].tenant_id, "t2");
    }

    #[tokio::test]
    async fn delete_tenant_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_tenant(&Tenant::new("t1", "dk-a")).await.unwrap();

        store.delete_tenant("t1").await.unwrap();
        store.delete_tenant("t1").await.unwrap();
        assert!(store.get_tenant("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_versions_skip_unresolved() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_tenant(&Tenant::new("t1", "a").with_version(v("1.0"))).await.unwrap();
        store.upsert_tenant(&Tenant::new("t2", "b").with_version(v("1.0"))).await.unwrap();
        store.upsert_tenant(&Tenant::new("t3", "c")).await.unwrap();

        let versions = store.tenant_versions().await.unwrap();
        assert_eq!(versions.len(), 1);
        assert!(versions.contains(&v("1.0")));
    }

    #[tokio::test]
    async fn duplicate_volume_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let vol = Volume::new("vol-1", "pod-1", "t1", v("1.0"));

        store.create_volume(&vol).await.unwrap();
        let err = store.create_volume(&vol).await.unwrap_err();
        assert!(matches!(err, AgentCacheError::VolumeConflict(id) if id == "vol-1"));
    }

    #[tokio::test]
    async fn concurrent_creates_of_one_volume_have_one_winner() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let vol = Volume::new("vol-1", format!("pod-{}", i), "t1", v("1.0"));
                store.create_volume(&vol).await
            }));
        }

        let mut ok = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn volume_roundtrip_and_used_versions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mounted = Utc::now() - Duration::minutes(3);
        let vol = Volume::new("vol-1", "pod-1", "t1", v("1.0")).mounted_at(mounted);
        store.create_volume(&vol).await.unwrap();
        store
            .create_volume(&Volume::new("vol-2", "pod-2", "t2", v("1.0")))
            .await
            .unwrap();
        store
            .create_volume(&Volume::new("vol-3", "pod-3", "t1", v("2.0")))
            .await
            .unwrap();

        let loaded = store.get_volume("vol-1").await.unwrap().unwrap();
        assert!(loaded.same_mount(&vol));
        assert_eq!(loaded.mounted_at.timestamp(), mounted.timestamp());

        let used = store.used_versions().await.unwrap();
        assert_eq!(used.len(), 2);

        assert_eq!(store.volumes_for_tenant("t1").await.unwrap().len(), 2);

        let pods = store.pod_names_to_volume_ids().await.unwrap();
        assert_eq!(pods.get("pod-2"), Some(&vec!["vol-2".to_string()]));

        store.delete_volume("vol-1").await.unwrap();
        store.delete_volume("vol-1").await.unwrap();
        assert_eq!(store.all_volumes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("csi.db");

        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.upsert_tenant(&Tenant::new("t1", "dk-a").with_version(v("1.0"))).await.unwrap();
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let tenant = store.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.latest_version, Some(v("1.0")));
    }
}
