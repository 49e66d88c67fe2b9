//! Mountpoint directories and daemon-side symlinks.
//!
//! Two path families are maintained here: mountpoint directories under the
//! pool prefix, and the symlinks under the daemon var directory that users
//! actually follow. Partial failure must not leave a symlink pointing at a
//! path that no longer exists, so the rename helper steps and reverts.

use crate::error::{Result, StorageError};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::Path;
use tracing::warn;

/// Stat-based mountpoint probe: a path is a mountpoint when it sits on a
/// different device than its parent. The filesystem root is one by
/// definition.
pub fn is_mount_point(path: &Path) -> bool {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return true,
    };
    match fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev(),
        Err(_) => false,
    }
}

/// True when the directory exists and contains no entries.
pub fn path_is_empty(path: &Path) -> bool {
    match fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| StorageError::io(format!("failed to chmod {}", path.display()), e))
}

/// Create (or re-point) `link` so it resolves to `target`. An existing
/// symlink is only replaced when it points somewhere else.
fn ensure_symlink(target: &Path, link: &Path) -> Result<()> {
    if let Ok(current) = fs::read_link(link) {
        if current == target {
            return Ok(());
        }
        fs::remove_file(link)
            .map_err(|e| StorageError::io(format!("failed to remove {}", link.display()), e))?;
    }
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| StorageError::io(format!("failed to create {}", parent.display()), e))?;
    }
    symlink(target, link).map_err(|e| {
        StorageError::io(
            format!("failed to link {} -> {}", link.display(), target.display()),
            e,
        )
    })
}

/// Create a container mountpoint directory and its var-side symlink.
/// Privileged containers get mode 0711, unprivileged 0700. Idempotent.
pub fn ensure_container_mountpoint(mount_dir: &Path, link: &Path, privileged: bool) -> Result<()> {
    let mode = if privileged { 0o711 } else { 0o700 };
    fs::create_dir_all(mount_dir)
        .map_err(|e| StorageError::io(format!("failed to create {}", mount_dir.display()), e))?;
    set_mode(mount_dir, mode)?;
    ensure_symlink(mount_dir, link)
}

/// Create the aggregate snapshots directory for a container and the
/// var-side symlink pointing at it. Idempotent.
pub fn ensure_snapshot_mountpoint(snapshots_dir: &Path, link: &Path) -> Result<()> {
    fs::create_dir_all(snapshots_dir)
        .map_err(|e| StorageError::io(format!("failed to create {}", snapshots_dir.display()), e))?;
    set_mode(snapshots_dir, 0o700)?;
    if !link.exists() && fs::read_link(link).is_err() {
        ensure_symlink(snapshots_dir, link)?;
    }
    Ok(())
}

/// Rename a mountpoint directory and replace its symlink. Reverts the
/// directory rename when the symlink step fails.
pub fn rename_mountpoint(
    old_dir: &Path,
    old_link: &Path,
    new_dir: &Path,
    new_link: &Path,
) -> Result<()> {
    if old_dir.exists() {
        fs::rename(old_dir, new_dir).map_err(|e| {
            StorageError::io(
                format!(
                    "failed to rename {} -> {}",
                    old_dir.display(),
                    new_dir.display()
                ),
                e,
            )
        })?;
    }

    let relink = || -> Result<()> {
        if fs::read_link(old_link).is_ok() {
            fs::remove_file(old_link).map_err(|e| {
                StorageError::io(format!("failed to remove {}", old_link.display()), e)
            })?;
        }
        ensure_symlink(new_dir, new_link)
    };

    if let Err(err) = relink() {
        if new_dir.exists() {
            if let Err(revert) = fs::rename(new_dir, old_dir) {
                warn!(
                    "Failed to revert mountpoint rename {}: {}",
                    new_dir.display(),
                    revert
                );
            }
        }
        return Err(err);
    }

    Ok(())
}

/// Remove a mountpoint directory and its symlink. Both are best-effort
/// gone afterwards; a missing path is not an error.
pub fn delete_mountpoint(mount_dir: &Path, link: &Path) -> Result<()> {
    if mount_dir.exists() {
        fs::remove_dir_all(mount_dir)
            .map_err(|e| StorageError::io(format!("failed to remove {}", mount_dir.display()), e))?;
    }
    if fs::read_link(link).is_ok() {
        fs::remove_file(link)
            .map_err(|e| StorageError::io(format!("failed to remove {}", link.display()), e))?;
    }
    Ok(())
}

/// Drop the aggregate snapshots directory and symlink once the last
/// snapshot is gone. No-op while siblings remain.
pub fn delete_snapshot_mountpoint(snapshots_dir: &Path, link: &Path) -> Result<()> {
    if snapshots_dir.exists() && !path_is_empty(snapshots_dir) {
        return Ok(());
    }
    if snapshots_dir.exists() {
        fs::remove_dir(snapshots_dir).map_err(|e| {
            StorageError::io(format!("failed to remove {}", snapshots_dir.display()), e)
        })?;
    }
    if fs::read_link(link).is_ok() {
        fs::remove_file(link)
            .map_err(|e| StorageError::io(format!("failed to remove {}", link.display()), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_container_mountpoint_idempotent() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pool/containers/ct1");
        let link = tmp.path().join("containers/ct1");

        ensure_container_mountpoint(&dir, &link, false).unwrap();
        assert!(dir.is_dir());
        assert_eq!(fs::read_link(&link).unwrap(), dir);
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o777, 0o700);

        // Second run leaves everything in place.
        ensure_container_mountpoint(&dir, &link, false).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), dir);
    }

    #[test]
    fn test_privileged_mode() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pool/containers/ct1");
        let link = tmp.path().join("containers/ct1");

        ensure_container_mountpoint(&dir, &link, true).unwrap();
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o777, 0o711);
    }

    #[test]
    fn test_symlink_replaced_only_when_wrong() {
        let tmp = tempdir().unwrap();
        let dir_a = tmp.path().join("a");
        let dir_b = tmp.path().join("b");
        let link = tmp.path().join("link");
        fs::create_dir_all(&dir_a).unwrap();
        fs::create_dir_all(&dir_b).unwrap();

        ensure_symlink(&dir_a, &link).unwrap();
        ensure_symlink(&dir_b, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), dir_b);
    }

    #[test]
    fn test_rename_mountpoint() {
        let tmp = tempdir().unwrap();
        let old_dir = tmp.path().join("pool/containers/ct1");
        let new_dir = tmp.path().join("pool/containers/ct2");
        let old_link = tmp.path().join("containers/ct1");
        let new_link = tmp.path().join("containers/ct2");

        ensure_container_mountpoint(&old_dir, &old_link, false).unwrap();
        rename_mountpoint(&old_dir, &old_link, &new_dir, &new_link).unwrap();

        assert!(!old_dir.exists());
        assert!(new_dir.is_dir());
        assert!(fs::read_link(&old_link).is_err());
        assert_eq!(fs::read_link(&new_link).unwrap(), new_dir);
    }

    #[test]
    fn test_delete_mountpoint() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pool/containers/ct1");
        let link = tmp.path().join("containers/ct1");

        ensure_container_mountpoint(&dir, &link, false).unwrap();
        delete_mountpoint(&dir, &link).unwrap();
        assert!(!dir.exists());
        assert!(fs::read_link(&link).is_err());

        // Deleting again is fine.
        delete_mountpoint(&dir, &link).unwrap();
    }

    #[test]
    fn test_delete_snapshot_mountpoint_keeps_nonempty() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("pool/snapshots/ct1");
        let link = tmp.path().join("snapshots/ct1");
        ensure_snapshot_mountpoint(&dir, &link).unwrap();

        fs::create_dir(dir.join("s1")).unwrap();
        delete_snapshot_mountpoint(&dir, &link).unwrap();
        assert!(dir.exists(), "non-empty aggregate dir must stay");

        fs::remove_dir(dir.join("s1")).unwrap();
        delete_snapshot_mountpoint(&dir, &link).unwrap();
        assert!(!dir.exists());
        assert!(fs::read_link(&link).is_err());
    }

    #[test]
    fn test_is_mount_point() {
        assert!(is_mount_point(Path::new("/")));
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("plain");
        fs::create_dir(&dir).unwrap();
        assert!(!is_mount_point(&dir));
    }
}
