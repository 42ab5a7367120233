//! Binary directory sweeps
//!
//! Both sweeps are best-effort: every removal is attempted, and the first
//! failure is returned once the directory has been walked.

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::version::VersionSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Subdirectories of `root` by name; a missing root has none
pub(crate) async fn list_subdirs(root: &Path) -> AgentCacheResult<Vec<(String, PathBuf)>> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(AgentCacheError::filesystem(root, e)),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AgentCacheError::filesystem(root, e))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            debug!("Ignoring non-directory {}", entry.path().display());
            continue;
        }
        dirs.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    dirs.sort();
    Ok(dirs)
}

/// Remove every listed version directory not in `protected`
///
/// Returns the removed names, or the first error after trying them all.
pub(crate) async fn remove_unprotected(
    dirs: Vec<(String, PathBuf)>,
    protected: &VersionSet,
) -> AgentCacheResult<Vec<String>> {
    let mut removed = Vec::new();
    let mut first_error = None;

    for (name, path) in dirs {
        if protected.contains_name(&name) {
            debug!("Keeping {}", path.display());
            continue;
        }

        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!("Removed unused agent binaries {}", path.display());
                removed.push(name);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                first_error.get_or_insert(AgentCacheError::filesystem(&path, e));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(removed),
    }
}

/// Remove staging leftovers last modified more than `max_age` ago
pub(crate) async fn remove_stale_staging(root: &Path, max_age: Duration) -> AgentCacheResult<usize> {
    let mut entries = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(AgentCacheError::filesystem(root, e)),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    let mut first_error = None;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| AgentCacheError::filesystem(root, e))?
    {
        let path = entry.path();
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age <= max_age {
            continue;
        }

        let result = if meta.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        match result {
            Ok(()) => {
                info!("Removed abandoned staging entry {}", path.display());
                removed += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove {}: {}", path.display(), e);
                first_error.get_or_insert(AgentCacheError::filesystem(&path, e));
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VersionId;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(list_subdirs(&dir.path().join("absent")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn files_are_not_listed() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("1.0")).unwrap();
        std::fs::write(dir.path().join("README"), "x").unwrap();

        let names: Vec<_> = list_subdirs(dir.path())
            .await
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["1.0"]);
    }

    #[tokio::test]
    async fn protected_versions_survive() {
        let dir = TempDir::new().unwrap();
        for name in ["1.0", "2.0", "3.0"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let protected: VersionSet = [VersionId::parse("2.0").unwrap()].into_iter().collect();

        let dirs = list_subdirs(dir.path()).await.unwrap();
        let removed = remove_unprotected(dirs, &protected).await.unwrap();

        assert_eq!(removed, vec!["1.0", "3.0"]);
        assert!(dir.path().join("2.0").exists());
    }

    #[tokio::test]
    async fn failed_removal_does_not_stop_the_rest() {
        let dir = TempDir::new().unwrap();
        for name in ["1.0", "3.0"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        // a NUL byte makes the removal fail regardless of privileges
        let dirs = vec![
            ("1.0".to_string(), dir.path().join("1.0")),
            ("2.0".to_string(), dir.path().join("bad\0name")),
            ("3.0".to_string(), dir.path().join("3.0")),
        ];

        let err = remove_unprotected(dirs, &VersionSet::new()).await.unwrap_err();

        assert!(matches!(err, AgentCacheError::Filesystem { .. }));
        assert!(!dir.path().join("1.0").exists());
        assert!(!dir.path().join("3.0").exists());
    }

    #[tokio::test]
    async fn fresh_staging_is_kept() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("in-flight")).unwrap();

        let removed = remove_stale_staging(dir.path(), Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(dir.path().join("in-flight").exists());
    }

    #[tokio::test]
    async fn missing_staging_root_is_fine() {
        let dir = TempDir::new().unwrap();
        let removed = remove_stale_staging(&dir.path().join("staging"), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 0);
    }
}
