//! Filesystem layout under the CSI data directory
//!
//! ```text
//! <root>/csi.db                         metadata store
//! <root>/shared/<version>/              shared agent binaries
//! <root>/staging/<uuid>/                in-flight installs
//! <root>/tenants/<tenant>/config/       per-tenant config view
//! <root>/tenants/<tenant>/agent/        per-tenant agent view
//! <root>/tenants/<tenant>/bin/<version> pre-migration binary layout
//! ```
//!
//! Pure path construction; nothing here touches the filesystem.

use crate::version::VersionId;
use std::path::{Path, PathBuf};

const METADATA_DB: &str = "csi.db";
const SHARED_DIR: &str = "shared";
const STAGING_DIR: &str = "staging";
const TENANTS_DIR: &str = "tenants";
const CONFIG_DIR: &str = "config";
const AGENT_DIR: &str = "agent";
const DEPRECATED_BIN_DIR: &str = "bin";

/// Maps tenants and versions to directories under a fixed root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    root_dir: PathBuf,
}

impl PathResolver {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.root_dir.join(METADATA_DB)
    }

    pub fn shared_binary_root(&self) -> PathBuf {
        self.root_dir.join(SHARED_DIR)
    }

    pub fn shared_binary_dir(&self, version: &VersionId) -> PathBuf {
        self.shared_binary_root().join(version.as_str())
    }

    /// Installs are staged here so the final rename stays on one filesystem
    pub fn staging_root(&self) -> PathBuf {
        self.root_dir.join(STAGING_DIR)
    }

    pub fn staging_dir(&self, id: &str) -> PathBuf {
        self.staging_root().join(id)
    }

    pub fn tenant_dir(&self, tenant_id: &str) -> PathBuf {
        self.root_dir.join(TENANTS_DIR).join(tenant_id)
    }

    pub fn tenant_config_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(CONFIG_DIR)
    }

    pub fn tenant_agent_dir(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(AGENT_DIR)
    }

    pub fn deprecated_agent_binary_root(&self, tenant_id: &str) -> PathBuf {
        self.tenant_dir(tenant_id).join(DEPRECATED_BIN_DIR)
    }

    /// Per-tenant binary location used before binaries were shared
    pub fn deprecated_agent_binary_dir(&self, tenant_id: &str, version: &VersionId) -> PathBuf {
        self.deprecated_agent_binary_root(tenant_id)
            .join(version.as_str())
    }
}
