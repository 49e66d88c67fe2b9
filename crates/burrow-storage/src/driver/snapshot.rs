//! Container snapshot lifecycle.
//!
//! Snapshots live on the parent container's dataset as
//! `@snapshot-<name>`. Their host presence is a mount directory under the
//! pool's snapshots tree plus one aggregate symlink per container under
//! the daemon var directory.

use super::ZfsDriver;
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tracing::{debug, warn};
use uuid::Uuid;

impl ZfsDriver {
    /// Snapshot a container and make sure the aggregate mount directory
    /// and symlink exist.
    pub async fn snapshot_create(&self, parent: &str, snap: &str) -> Result<()> {
        debug!(
            "Creating ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );

        let dataset = self.dataset(&names::container_fs(parent));
        self.zfs()
            .snapshot(&dataset, &names::snap_label(snap))
            .await?;

        if let Err(err) = self.snapshot_create_fill(parent, snap) {
            if let Err(cleanup) = self.snapshot_delete(parent, snap).await {
                warn!(
                    "Failed to revert creation of snapshot \"{}/{}\": {}",
                    parent, snap, cleanup
                );
            }
            return Err(err);
        }

        debug!(
            "Created ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );
        Ok(())
    }

    fn snapshot_create_fill(&self, parent: &str, snap: &str) -> Result<()> {
        let mount_dir = self.layout().snapshot_mount_point(parent, snap);
        fs::create_dir_all(&mount_dir)
            .map_err(|e| StorageError::io(format!("failed to create {}", mount_dir.display()), e))?;
        fs::set_permissions(&mount_dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| StorageError::io(format!("failed to chmod {}", mount_dir.display()), e))?;

        mountpoint::ensure_snapshot_mountpoint(
            &self.layout().snapshots_dir(parent),
            &self.layout().snapshot_symlink(parent),
        )
    }

    /// Delete a snapshot. One pinned by a clone is renamed to
    /// `copy-<uuid>` so the parent container can still be deleted later.
    pub async fn snapshot_delete(&self, parent: &str, snap: &str) -> Result<()> {
        debug!(
            "Deleting ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );

        let fs_name = names::container_fs(parent);
        let dataset = self.dataset(&fs_name);
        let label = names::snap_label(snap);

        if self.zfs().exists(&format!("{}@{}", dataset, label)).await {
            if self.snapshot_removable(&fs_name, &label).await? {
                self.zfs().snapshot_destroy(&dataset, &label).await?;
            } else {
                let parked = format!("{}{}", names::COPY_SNAPSHOT_PREFIX, Uuid::new_v4());
                self.zfs().snapshot_rename(&dataset, &label, &parked).await?;
            }
        }

        let mount_dir = self.layout().snapshot_mount_point(parent, snap);
        if mount_dir.exists() {
            fs::remove_dir_all(&mount_dir).map_err(|e| {
                StorageError::io(format!("failed to remove {}", mount_dir.display()), e)
            })?;
        }

        // Drop the aggregate directory and symlink when this was the last
        // snapshot.
        mountpoint::delete_snapshot_mountpoint(
            &self.layout().snapshots_dir(parent),
            &self.layout().snapshot_symlink(parent),
        )?;

        // Pre-pool-era leftovers.
        let legacy = self.layout().legacy_snapshot_file(parent, snap);
        if legacy.exists() {
            fs::remove_file(&legacy)
                .map_err(|e| StorageError::io(format!("failed to remove {}", legacy.display()), e))?;
        }
        let legacy_parent = self.layout().snapshot_symlink(parent);
        if legacy_parent.is_dir()
            && fs::read_link(&legacy_parent).is_err()
            && mountpoint::path_is_empty(&legacy_parent)
        {
            fs::remove_dir(&legacy_parent).map_err(|e| {
                StorageError::io(format!("failed to remove {}", legacy_parent.display()), e)
            })?;
        }

        debug!(
            "Deleted ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );
        Ok(())
    }

    /// Rename a snapshot on disk and move its host mount directory.
    /// Reverses to the old name when a host-side step fails.
    pub async fn snapshot_rename(&self, parent: &str, old: &str, new: &str) -> Result<()> {
        debug!(
            "Renaming ZFS storage volume for snapshot \"{}/{}\" to \"{}/{}\"",
            parent, old, parent, new
        );

        let dataset = self.dataset(&names::container_fs(parent));
        let old_label = names::snap_label(old);
        let new_label = names::snap_label(new);

        if old_label != new_label {
            self.zfs()
                .snapshot_rename(&dataset, &old_label, &new_label)
                .await?;
        }

        if let Err(err) = self.snapshot_rename_fill(parent, old, new) {
            if old_label != new_label {
                if let Err(revert) = self
                    .zfs()
                    .snapshot_rename(&dataset, &new_label, &old_label)
                    .await
                {
                    warn!(
                        "Failed to revert rename of snapshot \"{}/{}\": {}",
                        parent, new, revert
                    );
                }
            }
            return Err(err);
        }

        debug!(
            "Renamed ZFS storage volume for snapshot \"{}/{}\" to \"{}/{}\"",
            parent, old, parent, new
        );
        Ok(())
    }

    fn snapshot_rename_fill(&self, parent: &str, old: &str, new: &str) -> Result<()> {
        let legacy = self.layout().legacy_snapshot_file(parent, old);
        if legacy.exists() {
            fs::remove_file(&legacy)
                .map_err(|e| StorageError::io(format!("failed to remove {}", legacy.display()), e))?;
        }

        let old_dir = self.layout().snapshot_mount_point(parent, old);
        if old_dir.exists() {
            fs::remove_dir(&old_dir)
                .map_err(|e| StorageError::io(format!("failed to remove {}", old_dir.display()), e))?;
        }

        let new_dir = self.layout().snapshot_mount_point(parent, new);
        fs::create_dir_all(&new_dir)
            .map_err(|e| StorageError::io(format!("failed to create {}", new_dir.display()), e))?;
        fs::set_permissions(&new_dir, fs::Permissions::from_mode(0o700))
            .map_err(|e| StorageError::io(format!("failed to chmod {}", new_dir.display()), e))?;

        mountpoint::ensure_snapshot_mountpoint(
            &self.layout().snapshots_dir(parent),
            &self.layout().snapshot_symlink(parent),
        )
    }

    /// Expose a read-writeable view of a snapshot by cloning it into
    /// `snapshots/<parent>/<snap>` and mounting the clone.
    pub async fn snapshot_start(&self, parent: &str, snap: &str) -> Result<bool> {
        debug!(
            "Initializing ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );

        let source = self.dataset(&names::container_fs(parent));
        let clone = self.dataset(&names::snapshot_fs(parent, snap));
        let mount_point = self.layout().snapshot_mount_point(parent, snap);

        self.zfs()
            .clone_snapshot(&source, &names::snap_label(snap), &clone, &mount_point)
            .await?;
        self.zfs().mount(&clone, &mount_point).await?;

        debug!(
            "Initialized ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );
        Ok(true)
    }

    /// Destroy the temporary clone created by [`Self::snapshot_start`].
    pub async fn snapshot_stop(&self, parent: &str, snap: &str) -> Result<bool> {
        debug!(
            "Stopping ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );

        let clone = self.dataset(&names::snapshot_fs(parent, snap));
        self.zfs().destroy(&clone).await?;

        debug!(
            "Stopped ZFS storage volume for snapshot \"{}/{}\" on storage pool \"{}\"",
            parent, snap, self.pool().name
        );
        Ok(true)
    }

    /// Nothing to do: the migration stream populates the snapshot.
    pub async fn snapshot_create_empty(&self, _parent: &str, _snap: &str) -> Result<()> {
        Ok(())
    }
}
