//! CLI command implementations

pub mod check;
pub mod config;
pub mod gc;
pub mod install;
pub mod list;
pub mod publish;

pub use check::execute as check;
pub use config::execute as config;
pub use gc::execute as gc;
pub use install::execute as install;
pub use list::execute as list;
pub use publish::{publish, unpublish};

use crate::cluster::KubectlCluster;
use crate::config::Config;
use crate::error::AgentCacheResult;
use crate::metadata::SqliteStore;
use crate::paths::PathResolver;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handles every command needs: layout, store and cluster
pub(crate) struct Node {
    pub paths: PathResolver,
    pub store: Arc<SqliteStore>,
    pub cluster: Arc<KubectlCluster>,
}

impl Node {
    pub async fn open(config: &Config) -> AgentCacheResult<Self> {
        let paths = PathResolver::new(&config.storage.data_dir);
        debug!("Opening metadata store {}", paths.metadata_db_path().display());
        let store = SqliteStore::open(&paths.metadata_db_path()).await?;

        Ok(Self {
            paths,
            store: Arc::new(store),
            cluster: Arc::new(KubectlCluster::new(config.cluster.clone())),
        })
    }
}

/// Token cancelled on Ctrl-C / SIGINT
pub(crate) fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current phase");
            child.cancel();
        }
    });
    token
}
