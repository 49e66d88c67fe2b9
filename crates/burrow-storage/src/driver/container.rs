//! Container volume lifecycle.

use super::ZfsDriver;
use crate::config::{self, VolumeConfig};
use crate::coordinator::{OpKey, OpSlot, OpVerb, OperationMap};
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

impl ZfsDriver {
    /// Whether the container's dataset exists and can be mounted.
    pub async fn container_storage_ready(&self, name: &str) -> bool {
        let dataset = self.dataset(&names::container_fs(name));
        self.zfs().exists(&dataset).await
    }

    /// Create an empty container volume: fresh dataset, canonical
    /// mountpoint, mount directory and symlink, "create" template. Fully
    /// reverts on any failure.
    pub async fn container_create(&self, name: &str, privileged: bool) -> Result<()> {
        debug!(
            "Creating empty ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );

        let fs = names::container_fs(name);
        let dataset = self.dataset(&fs);
        let mount_point = self.layout().container_mount_point(name);

        self.zfs()
            .create(&dataset, &[("mountpoint", "none"), ("canmount", "noauto")])
            .await?;

        if let Err(err) = self
            .container_create_fill(name, privileged, &dataset, &mount_point)
            .await
        {
            if let Err(cleanup) = self.container_delete(name).await {
                warn!(
                    "Failed to revert creation of container \"{}\": {}",
                    name, cleanup
                );
            }
            return Err(err);
        }

        debug!(
            "Created empty ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );
        Ok(())
    }

    async fn container_create_fill(
        &self,
        name: &str,
        privileged: bool,
        dataset: &str,
        mount_point: &Path,
    ) -> Result<()> {
        self.zfs()
            .set_property(dataset, "mountpoint", &mount_point.display().to_string())
            .await?;

        let our_mount = self.container_mount(name, privileged).await?;
        let result = async {
            mountpoint::ensure_container_mountpoint(
                mount_point,
                &self.layout().container_symlink(name),
                privileged,
            )?;
            self.hooks().template_apply(name, "create").await
        }
        .await;

        if our_mount {
            if let Err(err) = self.container_unmount(name).await {
                debug!("Failed to unmount container \"{}\" after create: {}", name, err);
            }
        }

        result
    }

    /// Create a container volume as a clone of an image's readonly
    /// snapshot, creating the image volume on demand. Concurrent callers
    /// for the same fingerprint unpack the image at most once.
    pub async fn container_create_from_image(
        &self,
        name: &str,
        privileged: bool,
        fingerprint: &str,
    ) -> Result<()> {
        debug!(
            "Creating ZFS storage volume for container \"{}\" from image \"{}\" on storage pool \"{}\"",
            name, fingerprint, self.pool().name
        );

        let fs = names::container_fs(name);
        let image_fs = names::image_fs(fingerprint);
        let mount_point = self.layout().container_mount_point(name);

        let key = OpKey::new(&self.pool().name, OpVerb::ImageCreate, fingerprint);
        match OperationMap::global().enter(key) {
            OpSlot::InFlight(completion) => {
                // Someone else is unpacking this image; wait and assume it
                // worked out.
                completion.wait().await;
            }
            OpSlot::Acquired(guard) => {
                let result = if !self.zfs().exists(&self.dataset(&image_fs)).await {
                    self.image_create(fingerprint).await
                } else {
                    Ok(())
                };
                drop(guard);
                result?;
            }
        }

        self.zfs()
            .clone_snapshot(
                &self.dataset(&image_fs),
                "readonly",
                &self.dataset(&fs),
                &mount_point,
            )
            .await?;

        if let Err(err) = self
            .container_clone_fill(name, privileged, &mount_point)
            .await
        {
            if let Err(cleanup) = self.container_delete(name).await {
                warn!(
                    "Failed to revert creation of container \"{}\": {}",
                    name, cleanup
                );
            }
            return Err(err);
        }

        debug!(
            "Created ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );
        Ok(())
    }

    async fn container_clone_fill(
        &self,
        name: &str,
        privileged: bool,
        mount_point: &Path,
    ) -> Result<()> {
        let our_mount = self.container_mount(name, privileged).await?;
        let result = async {
            mountpoint::ensure_container_mountpoint(
                mount_point,
                &self.layout().container_symlink(name),
                privileged,
            )?;
            if !privileged {
                self.hooks().shift_rootfs(name).await?;
            }
            self.hooks().template_apply(name, "create").await
        }
        .await;

        if our_mount {
            if let Err(err) = self.container_unmount(name).await {
                debug!("Failed to unmount container \"{}\" after create: {}", name, err);
            }
        }

        result
    }

    /// Delete a container volume. A volume pinned by clones is tombstoned
    /// under `deleted/containers/<uuid>` instead of destroyed; otherwise
    /// the dataset goes away and its clone origin is garbage-collected.
    pub async fn container_delete(&self, name: &str) -> Result<()> {
        debug!(
            "Deleting ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );

        let fs = names::container_fs(name);
        let dataset = self.dataset(&fs);
        let mount_point = self.layout().container_mount_point(name);

        if self.zfs().exists(&dataset).await {
            let snapshots = self.zfs().list_snapshots(&dataset).await?;
            let mut removable = true;
            for snap in &snapshots {
                removable = self.snapshot_removable(&fs, snap).await?;
                if !removable {
                    break;
                }
            }

            if removable {
                // The origin has to be read before the dataset goes away.
                let origin = self.zfs().get_property(&dataset, "origin").await?;
                let origin_fs = self.strip_pool_prefix(&origin).to_string();

                self.zfs().destroy(&dataset).await?;
                self.cleanup_tombstone(origin_fs).await?;
            } else {
                self.zfs()
                    .set_property(&dataset, "mountpoint", "none")
                    .await?;
                let tombstone = self.dataset(&format!("deleted/containers/{}", Uuid::new_v4()));
                self.zfs().rename(&dataset, &tombstone).await?;
            }
        }

        mountpoint::delete_mountpoint(&mount_point, &self.layout().container_symlink(name))?;

        // Best-effort removal of any started-snapshot clones left behind.
        let aggregate = self.dataset(&format!("snapshots/{}", name));
        if let Err(err) = self.zfs().destroy(&aggregate).await {
            if !err.is_not_found() {
                debug!("Failed to destroy snapshot dataset \"{}\": {}", aggregate, err);
            }
        }

        // Leftover snapshot mountpoints and the aggregate symlink.
        let snapshots_dir = self.layout().snapshots_dir(name);
        if snapshots_dir.exists() {
            fs::remove_dir_all(&snapshots_dir).map_err(|e| {
                StorageError::io(format!("failed to remove {}", snapshots_dir.display()), e)
            })?;
        }
        let link = self.layout().snapshot_symlink(name);
        if fs::read_link(&link).is_ok() {
            fs::remove_file(&link)
                .map_err(|e| StorageError::io(format!("failed to remove {}", link.display()), e))?;
        }

        debug!(
            "Deleted ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );
        Ok(())
    }

    /// Rename a container volume and every host path derived from it.
    /// Compensates on failure by moving the dataset back under the old
    /// name and restoring its mountpoint.
    pub async fn container_rename(&self, old: &str, new: &str) -> Result<()> {
        debug!(
            "Renaming ZFS storage volume for container \"{}\" to \"{}\"",
            old, new
        );

        self.container_unmount(old).await?;

        let old_dataset = self.dataset(&names::container_fs(old));
        let new_dataset = self.dataset(&names::container_fs(new));
        self.zfs().rename(&old_dataset, &new_dataset).await?;

        if let Err(err) = self.container_rename_fill(old, new, &new_dataset).await {
            if let Err(revert) = self.zfs().rename(&new_dataset, &old_dataset).await {
                warn!(
                    "Failed to revert rename of container \"{}\": {}",
                    new, revert
                );
            } else {
                let old_mount_point = self.layout().container_mount_point(old);
                if let Err(revert) = self
                    .zfs()
                    .set_property(
                        &old_dataset,
                        "mountpoint",
                        &old_mount_point.display().to_string(),
                    )
                    .await
                {
                    warn!(
                        "Failed to restore mountpoint of container \"{}\": {}",
                        old, revert
                    );
                }
            }
            return Err(err);
        }

        debug!(
            "Renamed ZFS storage volume for container \"{}\" to \"{}\"",
            old, new
        );
        Ok(())
    }

    async fn container_rename_fill(&self, old: &str, new: &str, new_dataset: &str) -> Result<()> {
        let new_mount_point = self.layout().container_mount_point(new);
        self.zfs()
            .set_property(
                new_dataset,
                "mountpoint",
                &new_mount_point.display().to_string(),
            )
            .await?;

        // Setting the mountpoint may have mounted it again.
        self.container_unmount(new).await?;

        let old_mount_point = self.layout().container_mount_point(old);
        mountpoint::rename_mountpoint(
            &old_mount_point,
            &self.layout().container_symlink(old),
            &new_mount_point,
            &self.layout().container_symlink(new),
        )?;

        // Move the aggregate snapshot tree along.
        let old_snapshots_dir = self.layout().snapshots_dir(old);
        let new_snapshots_dir = self.layout().snapshots_dir(new);
        if old_snapshots_dir.exists() {
            fs::rename(&old_snapshots_dir, &new_snapshots_dir).map_err(|e| {
                StorageError::io(
                    format!(
                        "failed to rename {} -> {}",
                        old_snapshots_dir.display(),
                        new_snapshots_dir.display()
                    ),
                    e,
                )
            })?;
        }

        let old_link = self.layout().snapshot_symlink(old);
        if fs::read_link(&old_link).is_ok() {
            fs::remove_file(&old_link).map_err(|e| {
                StorageError::io(format!("failed to remove {}", old_link.display()), e)
            })?;
        }

        // Re-link only when the path already exists. After the removal
        // above it never does, so the aggregate symlink stays gone across
        // a rename; kept bug-for-bug compatible with the historical
        // behaviour.
        let new_link = self.layout().snapshot_symlink(new);
        if new_link.exists() {
            symlink(&new_snapshots_dir, &new_link).map_err(|e| {
                StorageError::io(format!("failed to link {}", new_link.display()), e)
            })?;
        }

        Ok(())
    }

    /// Check whether `snap` can be restored without touching anything.
    pub async fn container_can_restore(
        &self,
        name: &str,
        snap: &str,
        volume: &VolumeConfig,
    ) -> Result<()> {
        let user = self.user_snapshots(name).await?;
        if !user.iter().any(|s| s == snap) {
            return Err(StorageError::dataset_not_found(format!(
                "{}@{}",
                self.dataset(&names::container_fs(name)),
                names::snap_label(snap)
            )));
        }
        if user.last().map(String::as_str) != Some(snap)
            && !config::resolve_remove_snapshots(self.pool(), volume)
        {
            return Err(StorageError::snapshot_not_latest(snap));
        }
        Ok(())
    }

    /// Roll the container back to `snap`. Rollback only works against the
    /// most recent snapshot; newer ones are deleted first when the
    /// remove-snapshots preference allows it.
    pub async fn container_restore(
        &self,
        name: &str,
        snap: &str,
        volume: &VolumeConfig,
    ) -> Result<()> {
        debug!(
            "Restoring ZFS storage volume for container \"{}\" to snapshot \"{}\"",
            name, snap
        );

        let user = self.user_snapshots(name).await?;
        let position = user.iter().position(|s| s == snap).ok_or_else(|| {
            StorageError::dataset_not_found(format!(
                "{}@{}",
                self.dataset(&names::container_fs(name)),
                names::snap_label(snap)
            ))
        })?;

        let newer = &user[position + 1..];
        if !newer.is_empty() {
            if !config::resolve_remove_snapshots(self.pool(), volume) {
                return Err(StorageError::snapshot_not_latest(snap));
            }
            for doomed in newer.iter().rev() {
                self.snapshot_delete(name, doomed).await?;
            }
        }

        self.zfs()
            .rollback(
                &self.dataset(&names::container_fs(name)),
                &names::snap_label(snap),
            )
            .await?;

        debug!(
            "Restored ZFS storage volume for container \"{}\" to snapshot \"{}\"",
            name, snap
        );
        Ok(())
    }

    /// Apply a disk quota. Zero clears it.
    pub async fn container_set_quota(
        &self,
        name: &str,
        size_bytes: i64,
        volume: &VolumeConfig,
    ) -> Result<()> {
        debug!("Setting ZFS quota for container \"{}\"", name);

        let property = if config::resolve_use_refquota(self.pool(), volume) {
            "refquota"
        } else {
            "quota"
        };
        let value = if size_bytes > 0 {
            size_bytes.to_string()
        } else {
            "none".to_string()
        };

        self.zfs()
            .set_property(&self.dataset(&names::container_fs(name)), property, &value)
            .await?;

        debug!("Set ZFS quota for container \"{}\"", name);
        Ok(())
    }

    /// Current disk usage in bytes.
    pub async fn container_get_usage(&self, name: &str, volume: &VolumeConfig) -> Result<i64> {
        let property = if config::resolve_use_refquota(self.pool(), volume) {
            "usedbydataset"
        } else {
            "used"
        };

        let value = self
            .zfs()
            .get_property(&self.dataset(&names::container_fs(name)), property)
            .await?;

        value.parse::<i64>().map_err(|_| {
            StorageError::internal(format!(
                "unparseable {} value \"{}\" for container \"{}\"",
                property, value, name
            ))
        })
    }

    /// User snapshot names of a container in creation order, with the
    /// on-disk prefix stripped.
    pub(crate) async fn user_snapshots(&self, name: &str) -> Result<Vec<String>> {
        let dataset = self.dataset(&names::container_fs(name));
        let labels = self.zfs().list_snapshots(&dataset).await?;
        Ok(labels
            .iter()
            .filter_map(|label| names::user_snapshot_suffix(label))
            .map(str::to_string)
            .collect())
    }
}
