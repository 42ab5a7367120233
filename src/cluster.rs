//! Read-only cluster liveness lookups
//!
//! The correctness checker and the stale-volume sweep only need to know
//! whether a pod or a managed resource still exists. `KubectlCluster`
//! answers that by shelling out to `kubectl`; `StaticCluster` holds a fixed
//! in-memory view.

use crate::config::schema::ClusterConfig;
use crate::error::{AgentCacheError, AgentCacheResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::RwLock;
use tokio::process::Command;
use tracing::debug;

/// Liveness queries against the cluster
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Whether a pod with this name exists in any namespace
    async fn pod_exists(&self, pod_name: &str) -> AgentCacheResult<bool>;

    /// Whether the managed custom resource with this name exists
    async fn managed_resource_exists(&self, name: &str) -> AgentCacheResult<bool>;

    /// Human-readable backend name
    fn backend_name(&self) -> &'static str;
}

/// Cluster lookups through the `kubectl` CLI
pub struct KubectlCluster {
    config: ClusterConfig,
}

impl KubectlCluster {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Execute a kubectl command and return the output
    async fn exec(&self, args: &[&str]) -> AgentCacheResult<std::process::Output> {
        debug!("Executing: {} {:?}", self.config.kubectl, args);

        Command::new(&self.config.kubectl)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AgentCacheError::CliNotFound {
                        name: self.config.kubectl.clone(),
                        hint: "kubectl is required for cluster lookups".to_string(),
                    }
                } else {
                    AgentCacheError::Cluster(format!("running {}: {}", self.config.kubectl, e))
                }
            })
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

#[async_trait]
impl ClusterApi for KubectlCluster {
    async fn pod_exists(&self, pod_name: &str) -> AgentCacheResult<bool> {
        let selector = format!("metadata.name={}", pod_name);
        let output = self
            .exec(&[
                "get",
                "pods",
                "--all-namespaces",
                "--field-selector",
                &selector,
                "-o",
                "name",
            ])
            .await?;

        if output.status.success() {
            Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(AgentCacheError::Cluster(format!(
                "listing pod {}: {}",
                pod_name,
                stderr.trim()
            )))
        }
    }

    async fn managed_resource_exists(&self, name: &str) -> AgentCacheResult<bool> {
        let output = self
            .exec(&[
                "get",
                &self.config.resource,
                name,
                "-n",
                &self.config.namespace,
                "-o",
                "name",
            ])
            .await?;

        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            Ok(false)
        } else {
            Err(AgentCacheError::Cluster(format!(
                "getting {} {}: {}",
                self.config.resource,
                name,
                stderr.trim()
            )))
        }
    }

    fn backend_name(&self) -> &'static str {
        "kubectl"
    }
}

/// Fixed, mutable in-memory view of the cluster
#[derive(Default)]
pub struct StaticCluster {
    pods: RwLock<HashSet<String>>,
    resources: RwLock<HashSet<String>>,
}

impl StaticCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pods<I, S>(self, pods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for pod in pods {
            self.add_pod(pod);
        }
        self
    }

    pub fn with_resources<I, S>(self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for resource in resources {
            self.add_resource(resource);
        }
        self
    }

    pub fn add_pod(&self, name: impl Into<String>) {
        if let Ok(mut pods) = self.pods.write() {
            pods.insert(name.into());
        }
    }

    pub fn remove_pod(&self, name: &str) {
        if let Ok(mut pods) = self.pods.write() {
            pods.remove(name);
        }
    }

    pub fn add_resource(&self, name: impl Into<String>) {
        if let Ok(mut resources) = self.resources.write() {
            resources.insert(name.into());
        }
    }

    pub fn remove_resource(&self, name: &str) {
        if let Ok(mut resources) = self.resources.write() {
            resources.remove(name);
        }
    }
}

#[async_trait]
impl ClusterApi for StaticCluster {
    async fn pod_exists(&self, pod_name: &str) -> AgentCacheResult<bool> {
        self.pods
            .read()
            .map(|pods| pods.contains(pod_name))
            .map_err(|_| AgentCacheError::Internal("pod set lock poisoned".to_string()))
    }

    async fn managed_resource_exists(&self, name: &str) -> AgentCacheResult<bool> {
        self.resources
            .read()
            .map(|resources| resources.contains(name))
            .map_err(|_| AgentCacheError::Internal("resource set lock poisoned".to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "static"
    }
}
