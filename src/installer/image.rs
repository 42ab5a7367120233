//! Agent installs from OCI images
//!
//! The version of an image install is its manifest digest, so a tag that
//! moves produces a new shared directory while a re-pushed identical image
//! does not.

use crate::config::schema::InstallerConfig;
use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::registry::{Descriptor, DockerConfig, RegistryClient};
use crate::installer::staging::{install_atomically, unpack_tar};
use crate::installer::{http_agent, InstallOutcome, Installer, InstallerKind};
use crate::paths::PathResolver;
use crate::version::VersionId;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DOCKER_HUB: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// Parsed `registry/repository[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> AgentCacheResult<Self> {
        let invalid = |reason: &str| AgentCacheError::InvalidImageReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("must not contain whitespace"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                let hex = digest
                    .strip_prefix("sha256:")
                    .ok_or_else(|| invalid("only sha256 digests are supported"))?;
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("digest must be 64 hex characters"));
                }
                (name, Some(digest.to_ascii_lowercase()))
            }
            None => (reference, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_string()))
            }
            None => (name, None),
        };
        if tag.as_deref() == Some("") {
            return Err(invalid("empty tag"));
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid("empty repository path component"));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Digest if pinned, else tag
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `<scheme>://<registry>/v2/<repository>`
    pub fn base_url(&self) -> String {
        format!("{}://{}/v2/{}", self.scheme(), self.registry, self.repository)
    }

    fn scheme(&self) -> &'static str {
        let host = self.registry.split(':').next().unwrap_or(&self.registry);
        if host == "localhost" || host == "127.0.0.1" {
            "http"
        } else {
            "https"
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Layer compression, from the descriptor media type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LayerCompression {
    Gzip,
    None,
}

fn layer_compression(descriptor: &Descriptor) -> AgentCacheResult<LayerCompression> {
    let media_type = descriptor.media_type.as_str();
    if media_type.ends_with("+gzip") || media_type.ends_with(".tar.gzip") {
        Ok(LayerCompression::Gzip)
    } else if media_type.ends_with(".tar") || media_type.ends_with("layer.v1.tar") {
        Ok(LayerCompression::None)
    } else {
        Err(AgentCacheError::install(
            descriptor.digest.as_str(),
            format!("unsupported layer media type {:?}", media_type),
        ))
    }
}

/// GOARCH name of the running machine
fn platform_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Pulls an OCI image and unpacks its layers into the shared root
pub struct ImageInstaller {
    client: Arc<RegistryClient>,
    paths: PathResolver,
    /// Layer downloads still on disk, removed by `cleanup`
    scratch: Arc<Mutex<Vec<PathBuf>>>,
}

impl ImageInstaller {
    pub fn new(
        image: ImageReference,
        config: &InstallerConfig,
        paths: PathResolver,
    ) -> AgentCacheResult<Self> {
        let credential = match &config.docker_config {
            Some(path) => DockerConfig::load(path)?.credential_for(image.registry()),
            None => None,
        };
        if credential.is_some() {
            debug!("Using registry credential for {}", image.registry());
        }

        Ok(Self {
            client: Arc::new(RegistryClient::new(http_agent(config)?, image, credential)),
            paths,
            scratch: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn image(&self) -> &ImageReference {
        self.client.image()
    }
}

#[async_trait]
impl Installer for ImageInstaller {
    async fn resolve_version(&self, cancel: &CancellationToken) -> AgentCacheResult<VersionId> {
        if cancel.is_cancelled() {
            return Err(AgentCacheError::Cancelled);
        }

        let client = Arc::clone(&self.client);
        let digest = tokio::task::spawn_blocking(move || client.resolve_digest())
            .await
            .map_err(|e| AgentCacheError::Internal(format!("digest lookup task failed: {}", e)))??;

        info!("Image {} resolved to {}", self.client.image(), digest);
        VersionId::parse(&digest)
    }

    async fn install(
        &self,
        target: &VersionId,
        cancel: &CancellationToken,
    ) -> AgentCacheResult<InstallOutcome> {
        let client = Arc::clone(&self.client);
        let scratch = Arc::clone(&self.scratch);
        let scratch_root = self.paths.staging_root();
        let digest = format!("sha256:{}", target);

        install_atomically(&self.paths, target, InstallerKind::Image, cancel, move |dest, cancel| {
            let (mut manifest, _) = client.fetch_manifest(&digest)?;
            if manifest.is_index() {
                let entry = manifest
                    .select_platform("linux", platform_arch())
                    .ok_or_else(|| {
                        AgentCacheError::install(
                            digest.as_str(),
                            format!("no linux/{} image in index", platform_arch()),
                        )
                    })?
                    .digest
                    .clone();
                manifest = client.fetch_manifest(&entry)?.0;
            }

            for (index, layer) in manifest.layers.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(AgentCacheError::Cancelled);
                }
                let compression = layer_compression(layer)?;
                let blob = scratch_root.join(format!("{}.layer", uuid::Uuid::new_v4()));
                track(&scratch, &blob);

                let result = client
                    .download_blob(&layer.digest, &blob)
                    .and_then(|_| unpack_layer(&blob, compression, dest));
                release(&scratch, &blob);
                result?;
                debug!("Applied layer {}/{} ({})", index + 1, manifest.layers.len(), layer.digest);
            }
            Ok(())
        })
        .await
    }

    async fn cleanup(&self) {
        let leftovers: Vec<PathBuf> = match self.scratch.lock() {
            Ok(mut scratch) => scratch.drain(..).collect(),
            Err(_) => vec![],
        };
        for path in leftovers {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove layer download {}: {}", path.display(), e);
                }
            }
        }
        self.client.forget_credentials();
    }

    fn kind(&self) -> InstallerKind {
        InstallerKind::Image
    }
}

fn track(scratch: &Mutex<Vec<PathBuf>>, path: &Path) {
    if let Ok(mut s) = scratch.lock() {
        s.push(path.to_path_buf());
    }
}

fn release(scratch: &Mutex<Vec<PathBuf>>, path: &Path) {
    if std::fs::remove_file(path).is_ok() || !path.exists() {
        if let Ok(mut s) = scratch.lock() {
            s.retain(|p| p != path);
        }
    }
}

fn unpack_layer(blob: &Path, compression: LayerCompression, dest: &Path) -> AgentCacheResult<()> {
    let file = BufReader::new(File::open(blob).map_err(|e| AgentCacheError::filesystem(blob, e))?);
    match compression {
        LayerCompression::Gzip => unpack_tar(GzDecoder::new(file), dest)?,
        LayerCompression::None => unpack_tar(file, dest)?,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::staging::is_complete;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use httpmock::Method::{GET, HEAD};
    use httpmock::MockServer;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    fn sha(bytes: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
    }

    fn layer(files: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn parse_full_reference() {
        let r = ImageReference::parse("registry.example.com:5000/team/agent:1.2.3").unwrap();
        assert_eq!(r.registry(), "registry.example.com:5000");
        assert_eq!(r.repository(), "team/agent");
        assert_eq!(r.reference(), "1.2.3");
        assert_eq!(r.base_url(), "https://registry.example.com:5000/v2/team/agent");
        assert_eq!(r.to_string(), "registry.example.com:5000/team/agent:1.2.3");
    }

    #[test]
    fn parse_docker_hub_defaults() {
        let r = ImageReference::parse("agent").unwrap();
        assert_eq!(r.registry(), DOCKER_HUB);
        assert_eq!(r.repository(), "library/agent");
        assert_eq!(r.reference(), "latest");

        let r = ImageReference::parse("team/agent:2").unwrap();
        assert_eq!(r.repository(), "team/agent");
    }

    #[test]
    fn parse_digest_reference() {
        let digest = format!("sha256:{}", "c".repeat(64));
        let r = ImageReference::parse(&format!("localhost:5000/agent@{}", digest)).unwrap();
        assert_eq!(r.digest(), Some(digest.as_str()));
        assert_eq!(r.reference(), digest);
        assert!(r.base_url().starts_with("http://"));
    }

    #[test]
    fn parse_rejects_garbage() {
        for bad in ["", "a b", "agent:", "agent@md5:abc", "agent@sha256:xyz", "host.io//x"] {
            assert!(ImageReference::parse(bad).is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn layer_media_types() {
        let d = |m: &str| Descriptor {
            media_type: m.to_string(),
            digest: "sha256:00".to_string(),
            size: 0,
            platform: None,
        };
        assert_eq!(
            layer_compression(&d("application/vnd.oci.image.layer.v1.tar+gzip")).unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            layer_compression(&d("application/vnd.docker.image.rootfs.diff.tar.gzip")).unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            layer_compression(&d("application/vnd.oci.image.layer.v1.tar")).unwrap(),
            LayerCompression::None
        );
        assert!(layer_compression(&d("application/vnd.oci.image.layer.v1.tar+zstd")).is_err());
    }

    #[tokio::test]
    async fn pulls_and_unpacks_layers_in_order() {
        let base = layer(&[("agent/lib.so", b"v1"), ("agent/extra", b"x")]);
        let top = layer(&[("agent/lib.so", b"v2"), ("agent/.wh.extra", b"")]);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": sha(&base), "size": base.len()},
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": sha(&top), "size": top.len()},
            ]
        })
        .to_string()
        .into_bytes();
        let manifest_digest = sha(&manifest);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/v2/agent/manifests/1.0");
            then.status(200)
                .header("Docker-Content-Digest", manifest_digest.as_str());
        });
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/agent/manifests/{}", manifest_digest));
            then.status(200).body(&manifest);
        });
        let blobs: Vec<_> = [&base, &top]
            .into_iter()
            .map(|blob| {
                server.mock(|when, then| {
                    when.method(GET).path(format!("/v2/agent/blobs/{}", sha(blob)));
                    then.status(200).body(blob);
                })
            })
            .collect();

        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path());
        let installer = ImageInstaller::new(
            ImageReference::parse(&format!("{}/agent:1.0", server.address())).unwrap(),
            &InstallerConfig::default(),
            paths.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let version = installer.resolve_version(&cancel).await.unwrap();
        assert_eq!(format!("sha256:{}", version), manifest_digest);

        let outcome = installer.install(&version, &cancel).await.unwrap();
        installer.cleanup().await;
        assert!(outcome.freshly_installed);

        let target = paths.shared_binary_dir(&version);
        assert!(is_complete(&target));
        assert_eq!(std::fs::read(target.join("agent/lib.so")).unwrap(), b"v2");
        assert!(!target.join("agent/extra").exists());
        blobs.iter().for_each(|blob| blob.assert());

        let leftovers: Vec<_> = std::fs::read_dir(paths.staging_root())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn corrupt_layer_fails_cleanly() {
        let good = layer(&[("agent/lib.so", b"v1")]);
        let manifest = serde_json::json!({
            "layers": [
                {"mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": sha(&good)},
            ]
        })
        .to_string()
        .into_bytes();
        let manifest_digest = sha(&manifest);

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/agent/manifests/{}", manifest_digest));
            then.status(200).body(&manifest);
        });
        server.mock(|when, then| {
            when.method(GET).path(format!("/v2/agent/blobs/{}", sha(&good)));
            then.status(200).body("tampered");
        });

        let dir = TempDir::new().unwrap();
        let paths = PathResolver::new(dir.path());
        let installer = ImageInstaller::new(
            ImageReference::parse(&format!("{}/agent@{}", server.address(), manifest_digest)).unwrap(),
            &InstallerConfig::default(),
            paths.clone(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let version = installer.resolve_version(&cancel).await.unwrap();
        let err = installer.install(&version, &cancel).await.unwrap_err();
        installer.cleanup().await;

        assert!(err.to_string().contains("digest mismatch"));
        assert!(!paths.shared_binary_dir(&version).exists());
        assert_eq!(std::fs::read_dir(paths.staging_root()).unwrap().count(), 0);
    }
}
