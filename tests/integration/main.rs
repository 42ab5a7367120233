//! Integration tests for agent-cache

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn agent_cache(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("agent-cache");
        cmd.env_remove("CSI_DATA_DIR")
            .env_remove("MAX_UNMOUNTED_VOLUME_AGE")
            .env("AGENT_CACHE_CONFIG", temp.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        agent_cache(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("node-local agent binary cache"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        agent_cache(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("agent-cache"));
    }

    #[test]
    fn config_path() {
        let temp = TempDir::new().unwrap();
        agent_cache(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show_applies_data_dir() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("csi");
        agent_cache(&temp)
            .args(["--data-dir", data.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[storage]"))
            .stdout(predicate::str::contains(data.to_str().unwrap()));
    }

    #[test]
    fn invalid_config_is_reported() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            "[gc]\nmax_unmounted_volume_age = \"soon\"\n",
        )
        .unwrap();
        agent_cache(&temp)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn list_tenants_empty_json() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("csi");
        agent_cache(&temp)
            .args(["--data-dir", data.to_str().unwrap()])
            .args(["list", "tenants", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
        assert!(data.exists());
    }

    #[test]
    fn publish_without_tenant_fails() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("csi");
        agent_cache(&temp)
            .args(["--data-dir", data.to_str().unwrap()])
            .args(["publish", "--volume-id", "vol-1", "--pod", "p1", "--tenant", "dk-a"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Tenant not found"));
    }

    #[test]
    fn install_requires_source() {
        let temp = TempDir::new().unwrap();
        agent_cache(&temp)
            .args([
                "install",
                "--tenant",
                "dk-a",
                "--api-url",
                "https://t1.live.example.com/api",
            ])
            .assert()
            .failure();
    }

    #[test]
    fn install_with_agent_version_reports_bad_url() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("csi");
        agent_cache(&temp)
            .args(["--data-dir", data.to_str().unwrap()])
            .args([
                "install",
                "--tenant",
                "dk-a",
                "--api-url",
                "ftp://t1.live.example.com/api",
                "--agent-version",
                "1.2.3",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid API URL"));
    }
}

mod node_tests {
    use agent_cache::cluster::StaticCluster;
    use agent_cache::correctness::CorrectnessChecker;
    use agent_cache::error::{AgentCacheError, AgentCacheResult};
    use agent_cache::events::MemoryRecorder;
    use agent_cache::gc::{GarbageCollector, VolumeScope};
    use agent_cache::installer::staging::{install_atomically, is_complete};
    use agent_cache::installer::{InstallOutcome, Installer, InstallerKind};
    use agent_cache::metadata::{MetadataStore, SqliteStore, Tenant, Volume};
    use agent_cache::paths::PathResolver;
    use agent_cache::provisioner::{ProvisionRequest, Provisioner};
    use agent_cache::publisher::VolumePublisher;
    use agent_cache::version::VersionId;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const OWNER: &str = "dk-t1";
    const API_URL: &str = "https://t1.live.example.com/api";

    fn v(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    /// Installs a fixed version by writing a single binary
    struct FixedInstaller {
        paths: PathResolver,
        version: VersionId,
    }

    #[async_trait]
    impl Installer for FixedInstaller {
        async fn resolve_version(&self, _: &CancellationToken) -> AgentCacheResult<VersionId> {
            Ok(self.version.clone())
        }

        async fn install(
            &self,
            target: &VersionId,
            cancel: &CancellationToken,
        ) -> AgentCacheResult<InstallOutcome> {
            install_atomically(&self.paths, target, InstallerKind::Url, cancel, |dest, _| {
                std::fs::write(dest.join("agent"), b"#!/bin/sh\n")
                    .map_err(|e| AgentCacheError::filesystem(dest, e))
            })
            .await
        }

        async fn cleanup(&self) {}

        fn kind(&self) -> InstallerKind {
            InstallerKind::Url
        }
    }

    struct Node {
        _dir: TempDir,
        paths: PathResolver,
        store: Arc<SqliteStore>,
        cluster: Arc<StaticCluster>,
    }

    impl Node {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let paths = PathResolver::new(dir.path());
            let store = Arc::new(SqliteStore::open(&paths.metadata_db_path()).await.unwrap());
            let cluster = Arc::new(StaticCluster::new().with_resources([OWNER]));
            Self {
                _dir: dir,
                paths,
                store,
                cluster,
            }
        }

        async fn provision(&self, version: &str) -> bool {
            let provisioner = Provisioner::new(
                self.store.clone(),
                self.paths.clone(),
                Arc::new(MemoryRecorder::new()),
            );
            let installer = FixedInstaller {
                paths: self.paths.clone(),
                version: v(version),
            };
            let request = ProvisionRequest {
                owner_name: OWNER.to_string(),
                api_url: API_URL.to_string(),
            };
            provisioner
                .provision(&request, &installer, &CancellationToken::new())
                .await
                .unwrap()
                .freshly_installed
        }

        fn publisher(&self) -> VolumePublisher {
            VolumePublisher::new(self.store.clone(), self.paths.clone())
        }

        fn gc(&self) -> GarbageCollector {
            GarbageCollector::new(self.store.clone(), self.cluster.clone(), self.paths.clone())
        }

        fn checker(&self) -> CorrectnessChecker {
            CorrectnessChecker::new(self.store.clone(), self.cluster.clone(), self.paths.clone())
        }

        fn installed(&self, version: &str) -> bool {
            self.paths.shared_binary_dir(&v(version)).exists()
        }
    }

    #[tokio::test]
    async fn concurrent_installs_produce_one_directory() {
        let node = Node::new().await;
        let version = v("1.2.3");
        let populate = |dest: &std::path::Path, _: &CancellationToken| {
            std::fs::write(dest.join("agent"), b"bin").map_err(|e| AgentCacheError::filesystem(dest, e))
        };

        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(
            install_atomically(&node.paths, &version, InstallerKind::Url, &cancel, populate),
            install_atomically(&node.paths, &version, InstallerKind::Url, &cancel, populate),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let fresh = [a.freshly_installed, b.freshly_installed];
        assert_eq!(fresh.iter().filter(|f| **f).count(), 1);
        assert!(is_complete(&node.paths.shared_binary_dir(&version)));

        let again = install_atomically(&node.paths, &version, InstallerKind::Url, &cancel, populate)
            .await
            .unwrap();
        assert!(!again.freshly_installed);
    }

    #[tokio::test]
    async fn interrupted_install_leaves_nothing() {
        let node = Node::new().await;
        let version = v("1.2.3");

        let err = install_atomically(
            &node.paths,
            &version,
            InstallerKind::Image,
            &CancellationToken::new(),
            |dest, _| {
                std::fs::write(dest.join("half"), b"partial").unwrap();
                Err(AgentCacheError::install("1.2.3", "connection reset"))
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentCacheError::Install { .. }));
        assert!(!node.installed("1.2.3"));
    }

    #[tokio::test]
    async fn gc_keeps_protected_and_removes_the_rest() {
        let node = Node::new().await;
        for name in ["used", "pinned", "config-pinned", "orphan-a", "orphan-b"] {
            std::fs::create_dir_all(node.paths.shared_binary_dir(&v(name))).unwrap();
        }
        node.store
            .upsert_tenant(&Tenant::new("t1", OWNER).with_version(v("pinned")))
            .await
            .unwrap();
        node.store
            .create_volume(&Volume::new("vol-1", "p1", "t1", v("used")))
            .await
            .unwrap();
        node.cluster.add_pod("p1");

        let gc = node
            .gc()
            .with_config_pins([v("config-pinned")].into_iter().collect());
        let report = gc.collect_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.removed_versions, vec!["orphan-a", "orphan-b"]);
        for kept in ["used", "pinned", "config-pinned"] {
            assert!(node.installed(kept), "{} should survive", kept);
        }

        let second = gc.collect_all(&CancellationToken::new()).await.unwrap();
        assert!(second.removed_versions.is_empty());
    }

    #[tokio::test]
    async fn version_change_releases_old_binaries() {
        let node = Node::new().await;
        node.cluster.add_pod("pod-1");

        assert!(node.provision("abc123").await);
        node.publisher().publish("vol-1", "pod-1", OWNER).await.unwrap();

        node.gc().reconcile(OWNER, &CancellationToken::new()).await.unwrap();
        assert!(node.installed("abc123"));

        node.publisher().unpublish("vol-1").await.unwrap();
        assert!(node.provision("def456").await);

        let report = node.gc().reconcile(OWNER, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.removed_versions, vec!["abc123"]);
        assert!(!node.installed("abc123"));
        assert!(node.installed("def456"));
    }

    #[tokio::test]
    async fn stale_volume_removed_only_after_threshold() {
        let node = Node::new().await;
        let t0 = Utc::now();
        node.store
            .upsert_tenant(&Tenant::new("t1", OWNER).with_version(v("1.0")))
            .await
            .unwrap();
        node.store
            .create_volume(&Volume::new("v2", "p2", "t1", v("1.0")).mounted_at(t0))
            .await
            .unwrap();

        let gc = node
            .gc()
            .with_max_unmounted_age(std::time::Duration::from_secs(10 * 60));

        let early = gc
            .sweep_stale_volumes(&VolumeScope::All, t0 + ChronoDuration::minutes(5))
            .await
            .unwrap();
        assert!(early.is_empty());
        assert!(node.store.get_volume("v2").await.unwrap().is_some());

        let late = gc
            .sweep_stale_volumes(&VolumeScope::All, t0 + ChronoDuration::minutes(11))
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert!(node.store.get_volume("v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checker_prunes_deleted_resource() {
        let node = Node::new().await;
        node.store
            .upsert_tenant(&Tenant::new("tx", "mr-x").with_version(v("1.0")))
            .await
            .unwrap();
        node.store
            .upsert_tenant(&Tenant::new("t1", OWNER).with_version(v("1.0")))
            .await
            .unwrap();

        let report = node.checker().correct(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            report.pruned_tenants,
            vec![("tx".to_string(), "mr-x".to_string())]
        );
        assert!(node.store.get_tenant("tx").await.unwrap().is_none());
        assert!(node.store.get_tenant("t1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn checker_is_idempotent() {
        let node = Node::new().await;
        node.cluster.add_pod("p-live");
        node.store
            .upsert_tenant(&Tenant::new("t1", OWNER).with_version(v("1.0")))
            .await
            .unwrap();
        node.store
            .upsert_tenant(&Tenant::new("t2", "dk-gone"))
            .await
            .unwrap();
        for (id, pod) in [("vol-1", "p-live"), ("vol-2", "p-gone")] {
            node.store
                .create_volume(&Volume::new(id, pod, "t1", v("1.0")))
                .await
                .unwrap();
        }

        let first = node.checker().correct(&CancellationToken::new()).await.unwrap();
        assert_eq!(first.total_pruned(), 2);

        let second = node.checker().correct(&CancellationToken::new()).await.unwrap();
        assert_eq!(second.total_pruned(), 0);
        assert_eq!(second.remaining_tenants, 1);
        assert_eq!(second.remaining_volumes, 1);
    }
}
