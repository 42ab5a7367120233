//! OCI distribution client
//!
//! Just enough of the registry protocol to pull an image: manifest digest
//! lookup, manifest and index fetches, and verified blob downloads. Bearer
//! token challenges are answered using the credential from a Docker
//! `config.json`, if one was configured.

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::image::ImageReference;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use ureq::http::Response;
use ureq::Body;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "docker-content-digest";

/// Docker `config.json`, reduced to what registry auth needs
#[derive(Debug, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
}

impl DockerConfig {
    pub fn load(path: &Path) -> AgentCacheResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentCacheError::io(format!("reading {}", path.display()), e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Base64 `user:password` for a registry host
    ///
    /// Keys may be bare hosts or URLs such as `https://index.docker.io/v1/`.
    pub fn credential_for(&self, registry: &str) -> Option<String> {
        let wanted = normalize_registry(registry);
        self.auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .and_then(|(_, entry)| entry.auth.clone())
            .filter(|auth| !auth.is_empty())
    }
}

fn normalize_registry(key: &str) -> &str {
    let host = key
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "index.docker.io" | "docker.io" | "registry-1.docker.io" => "docker.io",
        other => other,
    }
}

/// OCI content descriptor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

/// Image manifest or image index
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Manifest {
    pub fn is_index(&self) -> bool {
        !self.manifests.is_empty()
    }

    /// Pick the entry of an index matching `os`/`arch`
    pub fn select_platform(&self, os: &str, arch: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == arch)
        })
    }
}

/// Registry access for one image repository
pub struct RegistryClient {
    agent: ureq::Agent,
    image: ImageReference,
    credential: Mutex<Option<String>>,
    token: Mutex<Option<String>>,
}

#[derive(Clone, Copy)]
enum Method {
    Head,
    Get,
}

impl RegistryClient {
    pub fn new(agent: ureq::Agent, image: ImageReference, credential: Option<String>) -> Self {
        Self {
            agent,
            image,
            credential: Mutex::new(credential),
            token: Mutex::new(None),
        }
    }

    pub fn image(&self) -> &ImageReference {
        &self.image
    }

    /// Drop held credentials and tokens
    pub fn forget_credentials(&self) {
        if let Ok(mut c) = self.credential.lock() {
            *c = None;
        }
        if let Ok(mut t) = self.token.lock() {
            *t = None;
        }
    }

    /// Content digest (`sha256:<hex>`) the reference currently points at
    pub fn resolve_digest(&self) -> AgentCacheResult<String> {
        if let Some(digest) = self.image.digest() {
            return Ok(digest.to_string());
        }

        let url = self.manifest_url(self.image.reference());
        let response = self.send(Method::Head, &url, MANIFEST_ACCEPT)?;
        if response.status().is_success() {
            if let Some(digest) = header(&response, DIGEST_HEADER) {
                debug!("Resolved {} to {}", self.image, digest);
                return Ok(digest);
            }
        }

        // Some registries omit the digest header on HEAD
        let (_, body) = self.fetch_manifest(self.image.reference())?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&body))))
    }

    /// Fetch a manifest by tag or digest, returning it with its raw bytes
    pub fn fetch_manifest(&self, reference: &str) -> AgentCacheResult<(Manifest, Vec<u8>)> {
        let url = self.manifest_url(reference);
        let mut response = self.send(Method::Get, &url, MANIFEST_ACCEPT)?;
        check_status(&response, &url)?;

        let mut body = Vec::new();
        response
            .body_mut()
            .as_reader()
            .read_to_end(&mut body)
            .map_err(|e| AgentCacheError::io(format!("reading manifest {}", url), e))?;

        if reference.starts_with("sha256:") {
            verify_digest(reference, &Sha256::digest(&body))?;
        }

        let manifest: Manifest = serde_json::from_slice(&body)?;
        Ok((manifest, body))
    }

    /// Stream a blob into `dest`, verifying its digest
    pub fn download_blob(&self, digest: &str, dest: &Path) -> AgentCacheResult<u64> {
        let url = format!("{}/blobs/{}", self.image.base_url(), digest);
        let response = self.send(Method::Get, &url, "*/*")?;
        check_status(&response, &url)?;

        let mut reader = response.into_body().into_reader();
        let mut file = File::create(dest).map_err(|e| AgentCacheError::filesystem(dest, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0u64;

        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| AgentCacheError::io(format!("downloading {}", digest), e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n])
                .map_err(|e| AgentCacheError::filesystem(dest, e))?;
            total += n as u64;
        }
        file.flush().map_err(|e| AgentCacheError::filesystem(dest, e))?;

        verify_digest(digest, &hasher.finalize())?;
        debug!("Downloaded blob {} ({} bytes)", digest, total);
        Ok(total)
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!("{}/manifests/{}", self.image.base_url(), reference)
    }

    fn send(&self, method: Method, url: &str, accept: &str) -> AgentCacheResult<Response<Body>> {
        let response = self.send_once(method, url, accept)?;
        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        let Some(challenge) = header(&response, "www-authenticate") else {
            return Ok(response);
        };
        let Some(params) = parse_bearer_challenge(&challenge) else {
            return Ok(response);
        };

        let token = self.fetch_token(&params)?;
        if let Ok(mut t) = self.token.lock() {
            *t = Some(token);
        }
        self.send_once(method, url, accept)
    }

    fn send_once(&self, method: Method, url: &str, accept: &str) -> AgentCacheResult<Response<Body>> {
        let request = match method {
            Method::Head => self.agent.head(url),
            Method::Get => self.agent.get(url),
        };
        let mut request = request.header("Accept", accept);

        if let Some(auth) = self.authorization() {
            request = request.header("Authorization", auth.as_str());
        }

        request
            .call()
            .map_err(|e| AgentCacheError::Install {
                version: self.image.to_string(),
                reason: format!("request to {} failed: {}", url, e),
            })
    }

    fn authorization(&self) -> Option<String> {
        if let Some(token) = self.token.lock().ok().and_then(|t| t.clone()) {
            return Some(format!("Bearer {}", token));
        }
        self.basic_credential().map(|c| format!("Basic {}", c))
    }

    fn basic_credential(&self) -> Option<String> {
        self.credential.lock().ok().and_then(|c| c.clone())
    }

    fn fetch_token(&self, params: &HashMap<String, String>) -> AgentCacheResult<String> {
        let realm = params.get("realm").ok_or_else(|| AgentCacheError::Install {
            version: self.image.to_string(),
            reason: "auth challenge without realm".to_string(),
        })?;

        let mut request = self.agent.get(realm);
        for key in ["service", "scope"] {
            if let Some(value) = params.get(key) {
                request = request.query(key, value);
            }
        }
        if let Some(credential) = self.basic_credential() {
            request = request.header("Authorization", format!("Basic {}", credential).as_str());
        }

        let mut response = request.call().map_err(|e| AgentCacheError::Install {
            version: self.image.to_string(),
            reason: format!("token request to {} failed: {}", realm, e),
        })?;
        check_status(&response, realm)?;

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| AgentCacheError::Install {
                version: self.image.to_string(),
                reason: format!("reading token response: {}", e),
            })?;
        let parsed: TokenResponse = serde_json::from_str(&body)?;
        parsed
            .token
            .or(parsed.access_token)
            .ok_or_else(|| AgentCacheError::Install {
                version: self.image.to_string(),
                reason: "token response carried no token".to_string(),
            })
    }
}

fn header(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn check_status(response: &Response<Body>, url: &str) -> AgentCacheResult<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(AgentCacheError::Install {
            version: url.to_string(),
            reason: format!("registry returned {}", status.as_u16()),
        })
    }
}

fn verify_digest(expected: &str, actual: &[u8]) -> AgentCacheResult<()> {
    let expected_hex = expected.strip_prefix("sha256:").unwrap_or(expected);
    let actual_hex = hex::encode(actual);
    if expected_hex.eq_ignore_ascii_case(&actual_hex) {
        Ok(())
    } else {
        Err(AgentCacheError::Install {
            version: expected.to_string(),
            reason: format!("digest mismatch: got sha256:{}", actual_hex),
        })
    }
}

/// Parse `Bearer realm="..",service="..",scope=".."`
fn parse_bearer_challenge(value: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }

        let value: String = if chars.peek() == Some(&'"') {
            chars.next();
            chars.by_ref().take_while(|c| *c != '"').collect()
        } else {
            chars.by_ref().take_while(|c| *c != ',').collect()
        };
        params.insert(key.trim().to_ascii_lowercase(), value);
    }

    Some(params)
}
