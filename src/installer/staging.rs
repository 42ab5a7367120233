//! Atomic materialization of shared binary directories
//!
//! Every install is written into its own directory under the staging root,
//! finished with a completion marker, and then renamed onto
//! `shared/<version>`. Readers therefore only ever see either no directory or
//! a complete one. When two installers race on one version, the first rename
//! wins and the loser discards its staging copy.

use crate::error::{AgentCacheError, AgentCacheResult};
use crate::installer::{InstallOutcome, InstallerKind};
use crate::paths::PathResolver;
use crate::version::VersionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Written last into a staged install; its presence means "complete"
pub const COMPLETION_MARKER: &str = ".agent-cache-complete";

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Contents of the completion marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub version: VersionId,
    pub installer: InstallerKind,
    pub installed_at: DateTime<Utc>,
}

/// Whether `dir` holds a finished install
pub fn is_complete(dir: &Path) -> bool {
    dir.join(COMPLETION_MARKER).is_file()
}

/// Read the completion marker of an installed directory
pub fn read_marker(dir: &Path) -> AgentCacheResult<CompletionMarker> {
    let path = dir.join(COMPLETION_MARKER);
    let content = fs::read_to_string(&path)
        .map_err(|e| AgentCacheError::io(format!("reading {}", path.display()), e))?;
    Ok(serde_json::from_str(&content)?)
}

/// Install `version` into the shared root using `populate`
///
/// `populate` runs on the blocking pool and fills the staging directory it is
/// given. It may check the token between its own phases. Any error removes
/// the staging directory before returning.
pub async fn install_atomically<F>(
    paths: &PathResolver,
    version: &VersionId,
    kind: InstallerKind,
    cancel: &CancellationToken,
    populate: F,
) -> AgentCacheResult<InstallOutcome>
where
    F: FnOnce(&Path, &CancellationToken) -> AgentCacheResult<()> + Send + 'static,
{
    let target = paths.shared_binary_dir(version);
    if is_complete(&target) {
        debug!("Version {} already installed at {}", version, target.display());
        return Ok(InstallOutcome::existing(version.clone()));
    }

    if cancel.is_cancelled() {
        return Err(AgentCacheError::Cancelled);
    }

    let staging = paths.staging_dir(&uuid::Uuid::new_v4().to_string());
    let shared_root = paths.shared_binary_root();
    let version_owned = version.clone();
    let token = cancel.clone();

    let result = tokio::task::spawn_blocking(move || {
        stage_and_commit(&staging, &shared_root, &target, &version_owned, kind, &token, populate)
    })
    .await
    .map_err(|e| AgentCacheError::Internal(format!("install task failed: {}", e)))?;

    match &result {
        Ok(outcome) if outcome.freshly_installed => {
            info!("Installed agent version {} ({})", version, kind)
        }
        Ok(_) => debug!("Lost install race for {}, using existing copy", version),
        Err(e) => warn!("Install of {} failed: {}", version, e),
    }
    result
}

fn stage_and_commit<F>(
    staging: &Path,
    shared_root: &Path,
    target: &Path,
    version: &VersionId,
    kind: InstallerKind,
    cancel: &CancellationToken,
    populate: F,
) -> AgentCacheResult<InstallOutcome>
where
    F: FnOnce(&Path, &CancellationToken) -> AgentCacheResult<()>,
{
    fs::create_dir_all(staging)
        .map_err(|e| AgentCacheError::filesystem(staging, e))?;

    let staged = populate(staging, cancel)
        .and_then(|()| {
            if cancel.is_cancelled() {
                Err(AgentCacheError::Cancelled)
            } else {
                Ok(())
            }
        })
        .and_then(|()| write_marker(staging, version, kind));

    if let Err(e) = staged {
        discard(staging);
        return Err(match e {
            AgentCacheError::Cancelled | AgentCacheError::Install { .. } => e,
            other => AgentCacheError::install(version.as_str(), other.to_string()),
        });
    }

    fs::create_dir_all(shared_root).map_err(|e| {
        discard(staging);
        AgentCacheError::filesystem(shared_root, e)
    })?;

    // A directory without a marker was not produced by a staged install
    if target.exists() && !is_complete(target) {
        warn!("Replacing incomplete directory {}", target.display());
        if let Err(e) = fs::remove_dir_all(target) {
            if e.kind() != std::io::ErrorKind::NotFound {
                discard(staging);
                return Err(AgentCacheError::filesystem(target, e));
            }
        }
    }

    match fs::rename(staging, target) {
        Ok(()) => Ok(InstallOutcome::fresh(version.clone())),
        Err(e) => {
            discard(staging);
            if is_complete(target) {
                Ok(InstallOutcome::existing(version.clone()))
            } else {
                Err(AgentCacheError::install(
                    version.as_str(),
                    format!("moving staged install into {}: {}", target.display(), e),
                ))
            }
        }
    }
}

fn write_marker(staging: &Path, version: &VersionId, kind: InstallerKind) -> AgentCacheResult<()> {
    let marker = CompletionMarker {
        version: version.clone(),
        installer: kind,
        installed_at: Utc::now(),
    };
    let path = staging.join(COMPLETION_MARKER);
    fs::write(&path, serde_json::to_vec_pretty(&marker)?)
        .map_err(|e| AgentCacheError::filesystem(path, e))
}

/// Best-effort removal of a staging directory
pub(crate) fn discard(staging: &Path) {
    if let Err(e) = fs::remove_dir_all(staging) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove staging dir {}: {}", staging.display(), e);
        }
    }
}

/// Unpack one (uncompressed) tar stream into `dest`, applying OCI whiteouts
pub(crate) fn unpack_tar<R: Read>(reader: R, dest: &Path) -> AgentCacheResult<usize> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut unpacked = 0;
    // Paths this layer wrote; opaque whiteouts only hide lower layers
    let mut written: HashSet<PathBuf> = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| AgentCacheError::io("reading archive entries", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| AgentCacheError::io("reading archive entry", e))?;
        let path: PathBuf = entry
            .path()
            .map_err(|e| AgentCacheError::io("reading archive entry path", e))?
            .into_owned();

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name.starts_with(WHITEOUT_PREFIX) {
            apply_whiteout(dest, &path, name, &written)?;
            continue;
        }

        // unpack_in refuses entries that would escape dest
        let was_written = entry
            .unpack_in(dest)
            .map_err(|e| AgentCacheError::io(format!("unpacking {}", path.display()), e))?;
        if was_written {
            unpacked += 1;
            written.insert(path.components().filter(|c| *c != Component::CurDir).collect());
        }
    }

    Ok(unpacked)
}

fn apply_whiteout(
    dest: &Path,
    entry_path: &Path,
    name: &str,
    written: &HashSet<PathBuf>,
) -> AgentCacheResult<()> {
    let rel_parent: PathBuf = entry_path
        .parent()
        .unwrap_or(Path::new(""))
        .components()
        .filter(|c| *c != Component::CurDir)
        .collect();
    let Some(parent) = resolve_inside(dest, &rel_parent)? else {
        return Ok(());
    };

    let hidden: Vec<PathBuf> = if name == OPAQUE_WHITEOUT {
        match fs::read_dir(&parent) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| rel_parent.join(e.file_name()))
                .filter(|rel| !written.iter().any(|w| w.starts_with(rel)))
                .collect(),
            Err(_) => vec![],
        }
    } else {
        vec![rel_parent.join(&name[WHITEOUT_PREFIX.len()..])]
    };

    for rel in hidden {
        let path = dest.join(&rel);
        let result = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            // a symlink is removed itself, never followed
            Ok(_) => fs::remove_file(&path),
            Err(_) => continue,
        };
        result.map_err(|e| AgentCacheError::filesystem(&path, e))?;
    }
    Ok(())
}

/// `dest/rel` if every component is a plain name and no existing one is a
/// symlink; `None` when it cannot name anything inside `dest`
fn resolve_inside(dest: &Path, rel: &Path) -> AgentCacheResult<Option<PathBuf>> {
    let mut path = dest.to_path_buf();
    for component in rel.components() {
        let Component::Normal(part) = component else {
            return Ok(None);
        };
        path.push(part);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                warn!("Ignoring whiteout below symlink {}", path.display());
                return Ok(None);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AgentCacheError::filesystem(&path, e)),
        }
    }
    Ok(Some(path))
}
