//! Collaborator seam between the storage driver and the rest of the
//! daemon.
//!
//! The driver deliberately does not own the container object model, the
//! image database, rsync, or UID/GID shifting. Each lifecycle operation
//! that needs one of those calls back through [`DaemonHooks`].

use crate::config::PoolConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Daemon-side collaborators consumed by the storage driver.
#[async_trait]
pub trait DaemonHooks: Send + Sync {
    /// Apply a container template stage ("create", "copy") after the
    /// rootfs becomes available.
    async fn template_apply(&self, container: &str, stage: &str) -> Result<()>;

    /// Shift rootfs ownership for an unprivileged container.
    async fn shift_rootfs(&self, container: &str) -> Result<()>;

    /// Unpack the downloaded image tarball into `target_dir`.
    async fn unpack_image(&self, fingerprint: &str, target_dir: &Path) -> Result<()>;

    /// Record the image volume in the image database.
    async fn image_db_create(&self, fingerprint: &str) -> Result<()>;

    /// Drop the image volume from the image database.
    async fn image_db_delete(&self, fingerprint: &str) -> Result<()>;

    /// Local rsync fallback copy with an optional bandwidth cap.
    async fn rsync_copy(&self, source: &Path, target: &Path, bwlimit: Option<&str>) -> Result<()>;

    /// Snapshot names ("s1", "s2", ...) of a container in creation order,
    /// from the daemon's metadata.
    async fn container_snapshots(&self, container: &str) -> Result<Vec<String>>;

    /// Create an empty snapshot record so metadata exists before the
    /// migration stream fills it in.
    async fn create_snapshot_record(&self, container: &str, snapshot: &str) -> Result<()>;

    /// Pool named by the container's root disk device.
    async fn root_disk_pool(&self, container: &str) -> Result<String>;

    /// Provision the backing zpool or root dataset for a new pool.
    async fn provision_pool(&self, pool: &PoolConfig) -> Result<()>;
}
