//! The per-pool ZFS storage driver.
//!
//! One `ZfsDriver` is instantiated per storage pool. Lifecycle operations
//! compose the dataset namer, the ZFS engine, the mountpoint manager, and
//! the operation coordinator; the daemon supplies everything else through
//! [`DaemonHooks`].

mod container;
mod copy;
mod custom;
mod image;
mod snapshot;

use crate::config::{self, PoolConfig};
use crate::coordinator::{OpKey, OpSlot, OpVerb, OperationMap};
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names::{self, StorageLayout};
use crate::traits::DaemonHooks;
use crate::zfs::ZfsEngine;
use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// ZFS-backed storage driver for one pool.
#[derive(Clone)]
pub struct ZfsDriver {
    pool: PoolConfig,
    layout: StorageLayout,
    zfs: Arc<dyn ZfsEngine>,
    hooks: Arc<dyn DaemonHooks>,
}

impl ZfsDriver {
    pub fn new(
        pool: PoolConfig,
        var_dir: impl Into<PathBuf>,
        zfs: Arc<dyn ZfsEngine>,
        hooks: Arc<dyn DaemonHooks>,
    ) -> Self {
        let layout = StorageLayout::new(var_dir, pool.name.clone());
        Self {
            pool,
            layout,
            zfs,
            hooks,
        }
    }

    /// Verify the ZFS tooling is usable and report the module version.
    /// Fatal at daemon start when the module is absent.
    pub async fn init(&self) -> Result<String> {
        let version = self.zfs.module_version().await?;
        debug!("Initializing a ZFS driver for pool \"{}\"", self.pool.name);
        Ok(version)
    }

    pub fn pool(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub(crate) fn zfs(&self) -> &dyn ZfsEngine {
        self.zfs.as_ref()
    }

    pub(crate) fn hooks(&self) -> &dyn DaemonHooks {
        self.hooks.as_ref()
    }

    /// Dataset prefix on disk: `zfs.pool_name` for adopted pools, the pool
    /// name otherwise.
    pub(crate) fn on_disk(&self) -> &str {
        self.pool.on_disk_name()
    }

    pub(crate) fn dataset(&self, fs: &str) -> String {
        names::dataset(self.on_disk(), fs)
    }

    /// Strip the on-disk pool prefix from a full dataset path, leaving the
    /// driver-relative filesystem name.
    pub(crate) fn strip_pool_prefix<'a>(&self, dataset: &'a str) -> &'a str {
        dataset
            .strip_prefix(&format!("{}/", self.on_disk()))
            .unwrap_or(dataset)
    }

    // Pool bootstrap ----------------------------------------------------

    pub async fn pool_create(&self) -> Result<()> {
        info!("Creating ZFS storage pool \"{}\"", self.pool.name);

        self.hooks.provision_pool(&self.pool).await?;

        let fill = async {
            let mount_point = self.layout.pool_mount_point();
            fs::create_dir_all(&mount_point).map_err(|e| {
                StorageError::io(format!("failed to create {}", mount_point.display()), e)
            })?;
            fs::set_permissions(&mount_point, fs::Permissions::from_mode(0o755)).map_err(|e| {
                StorageError::io(format!("failed to chmod {}", mount_point.display()), e)
            })?;
            self.pool_check().await
        };

        if let Err(err) = fill.await {
            if let Err(cleanup) = self.pool_delete().await {
                warn!(
                    "Failed to revert creation of storage pool \"{}\": {}",
                    self.pool.name, cleanup
                );
            }
            return Err(err);
        }

        info!("Created ZFS storage pool \"{}\"", self.pool.name);
        Ok(())
    }

    /// Re-import the backing pool when its dataset is missing and the
    /// source is a block device path.
    pub async fn pool_check(&self) -> Result<()> {
        debug!("Checking ZFS storage pool \"{}\"", self.pool.name);

        let source = self.pool.source().filter(|s| !s.is_empty()).ok_or_else(|| {
            StorageError::invalid_config("no \"source\" property found for the storage pool")
        })?;

        let pool_name = self.on_disk();
        if Path::new(source).is_absolute() && !self.zfs.exists(pool_name).await {
            debug!(
                "ZFS storage pool \"{}\" does not exist, trying to import it",
                pool_name
            );
            self.zfs
                .pool_import(pool_name, &self.layout.disks_dir())
                .await?;
            debug!("ZFS storage pool \"{}\" successfully imported", pool_name);
        }

        Ok(())
    }

    pub async fn pool_delete(&self) -> Result<()> {
        info!("Deleting ZFS storage pool \"{}\"", self.pool.name);

        self.zfs.pool_destroy(self.on_disk()).await?;

        let mount_point = self.layout.pool_mount_point();
        if mount_point.exists() {
            fs::remove_dir_all(&mount_point).map_err(|e| {
                StorageError::io(format!("failed to remove {}", mount_point.display()), e)
            })?;
        }

        info!("Deleted ZFS storage pool \"{}\"", self.pool.name);
        Ok(())
    }

    /// The pool itself needs no mount step; datasets mount individually.
    pub async fn pool_mount(&self) -> Result<bool> {
        Ok(true)
    }

    pub async fn pool_umount(&self) -> Result<bool> {
        Ok(true)
    }

    pub fn pool_update(&self, changed: &[String]) -> Result<()> {
        info!("Updating ZFS storage pool \"{}\"", self.pool.name);
        config::validate_pool_update(changed)?;
        info!("Updated ZFS storage pool \"{}\"", self.pool.name);
        Ok(())
    }

    pub fn volume_update(&self, volume: &str, changed: &[String]) -> Result<()> {
        info!(
            "Updating ZFS storage volume \"{}\" on storage pool \"{}\"",
            volume, self.pool.name
        );
        config::validate_volume_update(changed)?;
        info!(
            "Updated ZFS storage volume \"{}\" on storage pool \"{}\"",
            volume, self.pool.name
        );
        Ok(())
    }

    // Coordinated mount/unmount -----------------------------------------

    /// Mount a container volume. Returns whether this caller performed the
    /// mount; a concurrent caller waits for the in-flight operation and
    /// returns `false` without re-checking.
    pub async fn container_mount(&self, name: &str, privileged: bool) -> Result<bool> {
        debug!(
            "Mounting ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );

        let fs = names::container_fs(name);
        let mount_point = self.layout.container_mount_point(name);

        let key = OpKey::new(&self.pool.name, OpVerb::ContainerMount, name);
        let _guard = match OperationMap::global().enter(key) {
            OpSlot::InFlight(completion) => {
                completion.wait().await;
                // Assume the other caller succeeded; a failure will
                // surface on the next dataset access anyway.
                return Ok(false);
            }
            OpSlot::Acquired(guard) => guard,
        };

        // mount(2) will not create the mountpoint for us.
        if !mount_point.exists() {
            mountpoint::ensure_container_mountpoint(
                &mount_point,
                &self.layout.container_symlink(name),
                privileged,
            )?;
        }

        let mut our_mount = false;
        if !mountpoint::is_mount_point(&mount_point) {
            match self.zfs.mount(&self.dataset(&fs), &mount_point).await {
                Ok(()) => our_mount = true,
                Err(err) if err.is_busy() => {
                    // Known kernel condition: EBUSY although the path is
                    // not a mountpoint. Not ours, but safe to proceed.
                    warn!(
                        "ZFS returned EBUSY while \"{}\" is not a mountpoint",
                        mount_point.display()
                    );
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }

        debug!(
            "Mounted ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );
        Ok(our_mount)
    }

    pub async fn container_unmount(&self, name: &str) -> Result<bool> {
        debug!(
            "Unmounting ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );

        let fs = names::container_fs(name);
        let mount_point = self.layout.container_mount_point(name);

        let key = OpKey::new(&self.pool.name, OpVerb::ContainerUmount, name);
        let _guard = match OperationMap::global().enter(key) {
            OpSlot::InFlight(completion) => {
                completion.wait().await;
                return Ok(false);
            }
            OpSlot::Acquired(guard) => guard,
        };

        let mut our_umount = false;
        if mountpoint::is_mount_point(&mount_point) {
            self.zfs.unmount(&self.dataset(&fs), &mount_point).await?;
            our_umount = true;
        }

        debug!(
            "Unmounted ZFS storage volume for container \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );
        Ok(our_umount)
    }

    pub async fn custom_mount(&self, name: &str) -> Result<bool> {
        debug!(
            "Mounting ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );

        let fs = names::custom_fs(name);
        let mount_point = self.layout.custom_mount_point(name);

        let key = OpKey::new(&self.pool.name, OpVerb::CustomMount, name);
        let _guard = match OperationMap::global().enter(key) {
            OpSlot::InFlight(completion) => {
                completion.wait().await;
                return Ok(false);
            }
            OpSlot::Acquired(guard) => guard,
        };

        let mut our_mount = false;
        if !mountpoint::is_mount_point(&mount_point) {
            match self.zfs.mount(&self.dataset(&fs), &mount_point).await {
                Ok(()) => our_mount = true,
                Err(err) if err.is_busy() => {
                    warn!(
                        "ZFS returned EBUSY while \"{}\" is not a mountpoint",
                        mount_point.display()
                    );
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }

        debug!(
            "Mounted ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );
        Ok(our_mount)
    }

    pub async fn custom_unmount(&self, name: &str) -> Result<bool> {
        debug!(
            "Unmounting ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );

        let fs = names::custom_fs(name);
        let mount_point = self.layout.custom_mount_point(name);

        let key = OpKey::new(&self.pool.name, OpVerb::CustomUmount, name);
        let _guard = match OperationMap::global().enter(key) {
            OpSlot::InFlight(completion) => {
                completion.wait().await;
                return Ok(false);
            }
            OpSlot::Acquired(guard) => guard,
        };

        let mut our_umount = false;
        if mountpoint::is_mount_point(&mount_point) {
            self.zfs.unmount(&self.dataset(&fs), &mount_point).await?;
            our_umount = true;
        }

        debug!(
            "Unmounted ZFS storage volume \"{}\" on storage pool \"{}\"",
            name, self.pool.name
        );
        Ok(our_umount)
    }

    // Snapshot bookkeeping ----------------------------------------------

    /// A snapshot is removable when no clone pins it.
    pub(crate) async fn snapshot_removable(&self, fs: &str, snap: &str) -> Result<bool> {
        let qualified = format!("{}@{}", self.dataset(fs), snap);
        let clones = self.zfs.get_property(&qualified, "clones").await?;
        Ok(clones == "-" || clones.is_empty())
    }

    /// Garbage-collect a tombstoned dataset or snapshot once nothing pins
    /// it any more. Destroying a clone re-enters here with the clone's
    /// origin, which is how the `deleted/` namespace eventually drains.
    pub(crate) fn cleanup_tombstone<'a>(
        &'a self,
        fs: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !fs.starts_with("deleted/") {
                return Ok(());
            }

            if let Some((base, snap)) = fs.split_once('@') {
                if !self.snapshot_removable(base, snap).await? {
                    return Ok(());
                }

                self.zfs.snapshot_destroy(&self.dataset(base), snap).await?;

                let remaining = self.zfs.list_snapshots(&self.dataset(base)).await?;
                if remaining.is_empty() {
                    self.cleanup_tombstone(base.to_string()).await?;
                }
                return Ok(());
            }

            let snapshots = self.zfs.list_snapshots(&self.dataset(&fs)).await?;
            for snap in &snapshots {
                if !self.snapshot_removable(&fs, snap).await? {
                    return Ok(());
                }
            }

            let origin = self.zfs.get_property(&self.dataset(&fs), "origin").await?;
            self.zfs.destroy(&self.dataset(&fs)).await?;

            if origin != "-" && !origin.is_empty() {
                let origin_fs = self.strip_pool_prefix(&origin).to_string();
                self.cleanup_tombstone(origin_fs).await?;
            }
            Ok(())
        })
    }
}
