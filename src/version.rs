//! Version identifiers and version sets
//!
//! A version is either an image digest (hex, `sha256:` prefix stripped) or a
//! plain version string from the download API. Both name a directory under
//! the shared binary root, so every `VersionId` is a valid single path
//! component.

use crate::error::{AgentCacheError, AgentCacheResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const DIGEST_PREFIX: &str = "sha256:";
const MAX_LEN: usize = 255;

/// Validated agent version or image digest
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    /// Parse and validate a version identifier
    pub fn parse(value: &str) -> AgentCacheResult<Self> {
        let value = value.strip_prefix(DIGEST_PREFIX).unwrap_or(value);

        let invalid = |reason: &str| AgentCacheError::InvalidVersion {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        if value.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if value.len() > MAX_LEN {
            return Err(invalid("longer than 255 bytes"));
        }
        if value == "." || value == ".." {
            return Err(invalid("must not be a relative path component"));
        }
        if value.contains(['/', '\\', '\0']) {
            return Err(invalid("must not contain path separators or NUL"));
        }

        Ok(Self(value.to_string()))
    }

    /// Borrow as `&str`
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for VersionId {
    type Error = AgentCacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionId> for String {
    fn from(value: VersionId) -> Self {
        value.0
    }
}

/// Ordered set of versions
///
/// Used for the two GC protection sets: *used* (referenced by a volume) and
/// *pinned* (desired by a tenant or held by config). A shared directory is
/// retained iff its version is in `used.union(&pinned)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSet(BTreeSet<VersionId>);

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version, returning whether it was newly added
    pub fn insert(&mut self, version: VersionId) -> bool {
        self.0.insert(version)
    }

    pub fn contains(&self, version: &VersionId) -> bool {
        self.0.contains(version)
    }

    /// Membership test by directory name, without validating it first
    pub fn contains_name(&self, name: &str) -> bool {
        self.0.iter().any(|v| v.as_str() == name)
    }

    /// Every version present in either set
    pub fn union(&self, other: &VersionSet) -> VersionSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Versions in `self` that are not in `other`
    pub fn difference(&self, other: &VersionSet) -> VersionSet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VersionId> {
        self.0.iter()
    }
}

impl FromIterator<VersionId> for VersionSet {
    fn from_iter<I: IntoIterator<Item = VersionId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<VersionId> for VersionSet {
    fn extend<I: IntoIterator<Item = VersionId>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

impl IntoIterator for VersionSet {
    type Item = VersionId;
    type IntoIter = std::collections::btree_set::IntoIter<VersionId>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> VersionId {
        VersionId::parse(s).unwrap()
    }

    #[test]
    fn strips_digest_prefix() {
        assert_eq!(v("sha256:abc123").as_str(), "abc123");
        assert_eq!(v("1.2.3.20240101-120000").as_str(), "1.2.3.20240101-120000");
    }

    #[test]
    fn rejects_path_like_values() {
        for bad in ["", ".", "..", "a/b", "a\\b", "sha256:"] {
            assert!(VersionId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(VersionId::parse(&"x".repeat(256)).is_err());
    }

    #[test]
    fn serde_validates() {
        let parsed: VersionId = serde_json::from_str("\"sha256:ff00\"").unwrap();
        assert_eq!(parsed.as_str(), "ff00");
        assert!(serde_json::from_str::<VersionId>("\"../etc\"").is_err());
    }

    #[test]
    fn union_and_difference() {
        let used: VersionSet = [v("a"), v("b")].into_iter().collect();
        let pinned: VersionSet = [v("b"), v("c")].into_iter().collect();

        let protected = used.union(&pinned);
        assert_eq!(protected.len(), 3);

        let on_disk: VersionSet = [v("a"), v("c"), v("d")].into_iter().collect();
        let unused = on_disk.difference(&protected);
        assert_eq!(unused.iter().collect::<Vec<_>>(), vec![&v("d")]);
    }

    #[test]
    fn contains_name_matches_raw_directory_names() {
        let set: VersionSet = [v("abc")].into_iter().collect();
        assert!(set.contains_name("abc"));
        assert!(!set.contains_name("sha256:abc"));
    }
}
