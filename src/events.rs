//! Agent lifecycle events
//!
//! The provisioner reports every install outcome here. The controller layer
//! turns these into events on the managed resource; on the node they are
//! appended as JSON lines to the event log.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Outcome of one install attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    /// A new shared binary directory was created
    Installed,
    /// The version was already present on the node
    AlreadyPresent,
    /// The install failed and left nothing behind
    InstallFailed,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::AlreadyPresent => "already_present",
            Self::InstallFailed => "install_failed",
        }
    }
}

/// One lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub owner_name: String,
    pub tenant_id: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Sink for lifecycle events
///
/// Recording must never fail the install path, so implementations swallow
/// their own errors.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, event: LifecycleEvent);
}

/// File-based recorder that appends JSON lines
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EventRecorder for EventLog {
    async fn record(&self, event: LifecycleEvent) {
        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize lifecycle event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write event log {}: {}", self.path.display(), e);
        }
    }
}

/// Keeps events in memory, for callers that inspect them afterwards
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EventRecorder for MemoryRecorder {
    async fn record(&self, event: LifecycleEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
