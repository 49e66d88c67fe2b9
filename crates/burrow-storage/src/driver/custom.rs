//! Custom volume lifecycle.
//!
//! Custom volumes are plain datasets under `custom/` with no template or
//! image hooks; mount and unmount share the container code path's
//! coordinator semantics via [`super::ZfsDriver::custom_mount`].

use super::ZfsDriver;
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use tracing::{error, info, warn};

impl ZfsDriver {
    pub async fn custom_create(&self, name: &str) -> Result<()> {
        info!(
            "Creating ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );

        let dataset = self.dataset(&names::custom_fs(name));
        let mount_point = self.layout().custom_mount_point(name);

        if let Err(err) = self
            .zfs()
            .create(&dataset, &[("mountpoint", "none"), ("canmount", "noauto")])
            .await
        {
            error!(
                "Failed to create ZFS storage volume \"{}\" on storage pool \"{}\": {}",
                name, self.pool().name, err
            );
            return Err(err);
        }

        let fill = async {
            self.zfs()
                .set_property(&dataset, "mountpoint", &mount_point.display().to_string())
                .await?;

            fs::create_dir_all(&mount_point).map_err(|e| {
                StorageError::io(format!("failed to create {}", mount_point.display()), e)
            })?;
            fs::set_permissions(&mount_point, fs::Permissions::from_mode(0o711)).map_err(|e| {
                StorageError::io(format!("failed to chmod {}", mount_point.display()), e)
            })?;

            if !mountpoint::is_mount_point(&mount_point) {
                let _ = self.zfs().mount(&dataset, &mount_point).await;
            }
            Ok(())
        };

        if let Err(err) = fill.await {
            if let Err(cleanup) = self.custom_delete(name).await {
                warn!(
                    "Failed to revert creation of storage volume \"{}\": {}",
                    name, cleanup
                );
            }
            return Err(err);
        }

        info!(
            "Created ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );
        Ok(())
    }

    pub async fn custom_delete(&self, name: &str) -> Result<()> {
        info!(
            "Deleting ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );

        let dataset = self.dataset(&names::custom_fs(name));
        self.zfs().destroy(&dataset).await?;

        let mount_point = self.layout().custom_mount_point(name);
        if mount_point.exists() {
            fs::remove_dir_all(&mount_point).map_err(|e| {
                StorageError::io(format!("failed to remove {}", mount_point.display()), e)
            })?;
        }

        info!(
            "Deleted ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool().name
        );
        Ok(())
    }
}
