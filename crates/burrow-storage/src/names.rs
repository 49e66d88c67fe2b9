//! Dataset naming and host filesystem layout.
//!
//! Everything here is pure: logical (pool, kind, name) tuples map to ZFS
//! dataset paths on one side and to host mountpoint/symlink paths on the
//! other. No function in this module touches the filesystem.

use std::path::{Path, PathBuf};

/// Separator between a container name and its snapshot suffix in
/// daemon-level snapshot names ("ct/snap").
pub const SNAPSHOT_DELIMITER: char = '/';

/// Prefix carried by user snapshots on disk ("snapshot-<name>").
pub const SNAPSHOT_PREFIX: &str = "snapshot-";

/// Prefixes of driver-internal ephemeral snapshots.
pub const COPY_SNAPSHOT_PREFIX: &str = "copy-";
pub const COPY_SEND_SNAPSHOT_PREFIX: &str = "copy-send-";
pub const MIGRATION_SEND_SNAPSHOT_PREFIX: &str = "migration-send-";

/// Relative filesystem name for a container volume.
pub fn container_fs(name: &str) -> String {
    format!("containers/{}", name)
}

/// Relative filesystem name for a custom volume.
pub fn custom_fs(name: &str) -> String {
    format!("custom/{}", name)
}

/// Relative filesystem name for an image volume.
pub fn image_fs(fingerprint: &str) -> String {
    format!("images/{}", fingerprint)
}

/// Relative filesystem name for a started snapshot clone.
pub fn snapshot_fs(parent: &str, snap: &str) -> String {
    format!("snapshots/{}/{}", parent, snap)
}

/// Full dataset path for a relative filesystem name.
pub fn dataset(on_disk_pool: &str, fs: &str) -> String {
    format!("{}/{}", on_disk_pool, fs)
}

/// On-disk label for a user snapshot.
pub fn snap_label(snap: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, snap)
}

/// Split a daemon-level name into (parent, snapshot).
///
/// "ct/snap" yields ("ct", Some("snap")); a plain container name yields
/// (name, None).
pub fn split_snapshot_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, Some(snap)),
        None => (name, None),
    }
}

/// True when an on-disk snapshot label belongs to a user snapshot rather
/// than a driver-internal one.
pub fn is_user_snapshot(label: &str) -> bool {
    label.starts_with(SNAPSHOT_PREFIX)
}

/// Strip the user snapshot prefix, if present.
pub fn user_snapshot_suffix(label: &str) -> Option<&str> {
    label.strip_prefix(SNAPSHOT_PREFIX)
}

/// Host filesystem layout for one storage pool.
///
/// Pool-side paths live under `<var>/storage-pools/<pool>`; the daemon-side
/// symlinks users actually follow live directly under `<var>`.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    var_dir: PathBuf,
    pool_name: String,
}

impl StorageLayout {
    pub fn new(var_dir: impl Into<PathBuf>, pool_name: impl Into<String>) -> Self {
        Self {
            var_dir: var_dir.into(),
            pool_name: pool_name.into(),
        }
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn var_dir(&self) -> &Path {
        &self.var_dir
    }

    /// `<var>/storage-pools/<pool>`
    pub fn pool_mount_point(&self) -> PathBuf {
        self.var_dir.join("storage-pools").join(&self.pool_name)
    }

    /// `<var>/storage-pools/<pool>/containers/<name>`
    pub fn container_mount_point(&self, name: &str) -> PathBuf {
        self.pool_mount_point().join("containers").join(name)
    }

    /// `<var>/storage-pools/<pool>/custom/<name>`
    pub fn custom_mount_point(&self, name: &str) -> PathBuf {
        self.pool_mount_point().join("custom").join(name)
    }

    /// `<var>/storage-pools/<pool>/images` — parent of per-image unpack dirs
    pub fn images_dir(&self) -> PathBuf {
        self.pool_mount_point().join("images")
    }

    /// `<var>/storage-pools/<pool>/images/<fingerprint>`
    pub fn image_mount_point(&self, fingerprint: &str) -> PathBuf {
        self.images_dir().join(fingerprint)
    }

    /// `<var>/storage-pools/<pool>/snapshots/<parent>`
    pub fn snapshots_dir(&self, parent: &str) -> PathBuf {
        self.pool_mount_point().join("snapshots").join(parent)
    }

    /// `<var>/storage-pools/<pool>/snapshots/<parent>/<snap>`
    pub fn snapshot_mount_point(&self, parent: &str, snap: &str) -> PathBuf {
        self.snapshots_dir(parent).join(snap)
    }

    /// `<var>/containers/<name>` — the symlink users follow
    pub fn container_symlink(&self, name: &str) -> PathBuf {
        self.var_dir.join("containers").join(name)
    }

    /// `<var>/snapshots/<parent>` — aggregate snapshot symlink
    pub fn snapshot_symlink(&self, parent: &str) -> PathBuf {
        self.var_dir.join("snapshots").join(parent)
    }

    /// `<var>/snapshots/<parent>/<snap>.zfs` — pre-pool-era pseudo-file
    pub fn legacy_snapshot_file(&self, parent: &str, snap: &str) -> PathBuf {
        self.var_dir
            .join("snapshots")
            .join(parent)
            .join(format!("{}.zfs", snap))
    }

    /// `<var>/images/<fingerprint>.zfs` — pre-pool-era pseudo-file
    pub fn legacy_image_file(&self, fingerprint: &str) -> PathBuf {
        self.var_dir.join("images").join(format!("{}.zfs", fingerprint))
    }

    /// `<var>/images/<fingerprint>` — downloaded image tarball
    pub fn image_source_path(&self, fingerprint: &str) -> PathBuf {
        self.var_dir.join("images").join(fingerprint)
    }

    /// `<var>/disks` — loop files scanned by `zpool import -d`
    pub fn disks_dir(&self) -> PathBuf {
        self.var_dir.join("disks")
    }
}
