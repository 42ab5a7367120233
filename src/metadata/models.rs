//! Metadata records

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::version::VersionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row per managed resource that requested agent injection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Derived from the managed resource's API URL
    pub tenant_id: String,

    /// Name of the managed resource
    pub owner_name: String,

    /// Desired version, `None` until resolved
    pub latest_version: Option<VersionId>,
}

impl Tenant {
    pub fn new(tenant_id: impl Into<String>, owner_name: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            owner_name: owner_name.into(),
            latest_version: None,
        }
    }

    pub fn with_version(mut self, version: VersionId) -> Self {
        self.latest_version = Some(version);
        self
    }
}

/// A CSI volume bind-mounted into a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub pod_name: String,
    pub tenant_id: String,
    pub version: VersionId,
    pub mounted_at: DateTime<Utc>,
}

impl Volume {
    /// Create a volume record mounted now
    pub fn new(
        volume_id: impl Into<String>,
        pod_name: impl Into<String>,
        tenant_id: impl Into<String>,
        version: VersionId,
    ) -> Self {
        Self {
            volume_id: volume_id.into(),
            pod_name: pod_name.into(),
            tenant_id: tenant_id.into(),
            version,
            mounted_at: Utc::now(),
        }
    }

    /// Override the mount timestamp
    pub fn mounted_at(mut self, at: DateTime<Utc>) -> Self {
        self.mounted_at = at;
        self
    }

    /// Whether the volume was mounted more than `max_age` before `now`
    pub fn is_older_than(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.mounted_at > max_age
    }

    /// Same pod and version, ignoring the mount timestamp
    pub fn same_mount(&self, other: &Volume) -> bool {
        self.volume_id == other.volume_id
            && self.pod_name == other.pod_name
            && self.tenant_id == other.tenant_id
            && self.version == other.version
    }
}

/// Derive the tenant identifier from a managed resource's API URL
///
/// Supported shapes:
/// - `https://<tenant>.<domain>/api` (SaaS)
/// - `https://<host>/e/<tenant>/api` (managed cluster)
pub fn tenant_id_from_api_url(api_url: &str) -> AgentCacheResult<String> {
    let invalid = |reason: &str| AgentCacheError::InvalidApiUrl {
        url: api_url.to_string(),
        reason: reason.to_string(),
    };

    let rest = api_url
        .strip_prefix("https://")
        .or_else(|| api_url.strip_prefix("http://"))
        .ok_or_else(|| invalid("missing http(s) scheme"))?;

    let rest = rest.trim_end_matches('/');
    let (host, path) = rest.split_once('/').ok_or_else(|| invalid("missing /api path"))?;

    let segments: Vec<&str> = path.split('/').collect();
    if segments.last() != Some(&"api") {
        return Err(invalid("path must end in /api"));
    }

    let tenant = match segments.as_slice() {
        ["e", tenant, "api"] => *tenant,
        ["api"] => {
            let (label, domain) = host
                .split_once('.')
                .ok_or_else(|| invalid("host has no tenant subdomain"))?;
            if domain.is_empty() {
                return Err(invalid("host has no domain"));
            }
            label
        }
        _ => return Err(invalid("unrecognized path layout")),
    };

    if tenant.is_empty() || !tenant.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(invalid("tenant segment is not a plain identifier"));
    }

    Ok(tenant.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn tenant_from_saas_url() {
        assert_eq!(
            tenant_id_from_api_url("https://abc12345.live.example.com/api").unwrap(),
            "abc12345"
        );
        assert_eq!(
            tenant_id_from_api_url("https://abc12345.live.example.com/api/").unwrap(),
            "abc12345"
        );
    }

    #[test]
    fn tenant_from_managed_url() {
        assert_eq!(
            tenant_id_from_api_url("https://cluster.internal:8443/e/tenant-1/api").unwrap(),
            "tenant-1"
        );
    }

    #[test]
    fn tenant_from_bad_urls() {
        for url in [
            "abc.example.com/api",
            "https://abc.example.com",
            "https://abc.example.com/v1",
            "https://localhost/api",
            "https://host/e//api",
            "https://host/e/../api",
        ] {
            assert!(tenant_id_from_api_url(url).is_err(), "{url} should fail");
        }
    }

    #[test]
    fn volume_age() {
        let now = Utc::now();
        let vol = Volume::new("v1", "p1", "t1", VersionId::parse("1.0").unwrap())
            .mounted_at(now - Duration::minutes(5));

        assert!(!vol.is_older_than(Duration::minutes(10), now));
        assert!(vol.is_older_than(Duration::minutes(4), now));
    }

    #[test]
    fn same_mount_ignores_timestamp() {
        let version = VersionId::parse("1.0").unwrap();
        let a = Volume::new("v1", "p1", "t1", version.clone());
        let b = a.clone().mounted_at(a.mounted_at - Duration::hours(1));
        let c = Volume::new("v1", "p2", "t1", version);

        assert!(a.same_mount(&b));
        assert!(!a.same_mount(&c));
    }
}
