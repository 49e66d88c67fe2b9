//! Image volume lifecycle.
//!
//! An image volume holds an unpacked, read-only filesystem image plus a
//! `@readonly` snapshot that container clones hang off. Creation happens
//! through a temporary staging mountpoint so the dataset never appears
//! half-populated at its public path. Callers racing on the same
//! fingerprint must hold the image-create coordinator key.

use super::ZfsDriver;
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{debug, warn};

impl ZfsDriver {
    /// Create the image volume for `fingerprint`, adopting a tombstoned
    /// copy when one exists. Fully reverts on failure.
    pub async fn image_create(&self, fingerprint: &str) -> Result<()> {
        debug!(
            "Creating ZFS storage volume for image \"{}\" on storage pool \"{}\"",
            fingerprint, self.pool().name
        );

        let fs_name = names::image_fs(fingerprint);
        let dataset = self.dataset(&fs_name);

        self.hooks().image_db_create(fingerprint).await?;

        // A clone may have pinned a previous incarnation of this image;
        // take the tombstone back instead of unpacking again.
        let tombstone = self.dataset(&format!("deleted/{}", fs_name));
        if self.zfs().exists(&tombstone).await {
            if let Err(err) = self.image_adopt(&tombstone, &dataset).await {
                if let Err(cleanup) = self.image_delete(fingerprint).await {
                    warn!(
                        "Failed to revert adoption of image \"{}\": {}",
                        fingerprint, cleanup
                    );
                }
                return Err(err);
            }

            debug!(
                "Created ZFS storage volume for image \"{}\" on storage pool \"{}\"",
                fingerprint, self.pool().name
            );
            return Ok(());
        }

        let image_mount_point = self.layout().image_mount_point(fingerprint);
        let created_mount_point = !image_mount_point.exists();
        if created_mount_point {
            fs::create_dir_all(&image_mount_point).map_err(|e| {
                StorageError::io(format!("failed to create {}", image_mount_point.display()), e)
            })?;
            fs::set_permissions(&image_mount_point, fs::Permissions::from_mode(0o700)).map_err(
                |e| StorageError::io(format!("failed to chmod {}", image_mount_point.display()), e),
            )?;
        }

        let images_dir = self.layout().images_dir();
        fs::create_dir_all(&images_dir)
            .map_err(|e| StorageError::io(format!("failed to create {}", images_dir.display()), e))?;
        let staging = tempfile::Builder::new()
            .prefix("burrow_image_")
            .tempdir_in(&images_dir)
            .map_err(|e| StorageError::io("failed to create image staging directory", e))?;

        if let Err(err) = self.zfs().create(&dataset, &[("mountpoint", "none")]).await {
            // Nothing landed on disk yet, so only the bookkeeping needs
            // undoing.
            if let Err(cleanup) = self.hooks().image_db_delete(fingerprint).await {
                warn!(
                    "Failed to remove image record for \"{}\": {}",
                    fingerprint, cleanup
                );
            }
            if created_mount_point {
                let _ = fs::remove_dir_all(&image_mount_point);
            }
            return Err(err);
        }

        if let Err(err) = self
            .image_create_fill(fingerprint, &dataset, staging.path())
            .await
        {
            if let Err(cleanup) = self.image_delete(fingerprint).await {
                warn!(
                    "Failed to revert creation of image \"{}\": {}",
                    fingerprint, cleanup
                );
            }
            return Err(err);
        }

        debug!(
            "Created ZFS storage volume for image \"{}\" on storage pool \"{}\"",
            fingerprint, self.pool().name
        );
        Ok(())
    }

    async fn image_adopt(&self, tombstone: &str, dataset: &str) -> Result<()> {
        self.zfs().rename(tombstone, dataset).await?;
        // A stale mountpoint can survive from before the tombstoning.
        self.zfs().set_property(dataset, "mountpoint", "none").await
    }

    async fn image_create_fill(
        &self,
        fingerprint: &str,
        dataset: &str,
        staging: &Path,
    ) -> Result<()> {
        self.zfs()
            .set_property(dataset, "mountpoint", &staging.display().to_string())
            .await?;

        // Setting the property does not guarantee an actual mount.
        if !mountpoint::is_mount_point(staging) {
            let _ = self.zfs().mount(dataset, staging).await;
        }

        self.hooks().unpack_image(fingerprint, staging).await?;

        self.zfs().set_property(dataset, "readonly", "on").await?;
        self.zfs().set_property(dataset, "mountpoint", "none").await?;

        if mountpoint::is_mount_point(staging) {
            let _ = self.zfs().unmount(dataset, staging).await;
        }

        // The snapshot container clones hang off.
        self.zfs().snapshot(dataset, "readonly").await
    }

    /// Delete the image volume, tombstoning it when container clones
    /// still pin the readonly snapshot.
    pub async fn image_delete(&self, fingerprint: &str) -> Result<()> {
        debug!(
            "Deleting ZFS storage volume for image \"{}\" on storage pool \"{}\"",
            fingerprint, self.pool().name
        );

        let fs_name = names::image_fs(fingerprint);
        let dataset = self.dataset(&fs_name);

        if self.zfs().exists(&dataset).await {
            // A half-created image without its readonly snapshot is
            // trivially removable.
            let removable = match self.snapshot_removable(&fs_name, "readonly").await {
                Ok(removable) => removable,
                Err(err) if err.is_not_found() => true,
                Err(err) => return Err(err),
            };

            if removable {
                self.zfs().destroy(&dataset).await?;
            } else {
                self.zfs()
                    .set_property(&dataset, "mountpoint", "none")
                    .await?;
                self.zfs()
                    .rename(&dataset, &self.dataset(&format!("deleted/{}", fs_name)))
                    .await?;
            }
        }

        self.hooks().image_db_delete(fingerprint).await?;

        let image_mount_point = self.layout().image_mount_point(fingerprint);
        if image_mount_point.exists() {
            fs::remove_dir_all(&image_mount_point).map_err(|e| {
                StorageError::io(format!("failed to remove {}", image_mount_point.display()), e)
            })?;
        }

        let legacy = self.layout().legacy_image_file(fingerprint);
        if legacy.exists() {
            fs::remove_file(&legacy)
                .map_err(|e| StorageError::io(format!("failed to remove {}", legacy.display()), e))?;
        }

        debug!(
            "Deleted ZFS storage volume for image \"{}\" on storage pool \"{}\"",
            fingerprint, self.pool().name
        );
        Ok(())
    }

    /// Images are never mounted at their public path.
    pub async fn image_mount(&self, _fingerprint: &str) -> Result<bool> {
        Ok(true)
    }

    pub async fn image_umount(&self, _fingerprint: &str) -> Result<bool> {
        Ok(true)
    }
}
