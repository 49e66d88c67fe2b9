//! Pool and volume configuration.
//!
//! Both entities carry a free-form key/value map owned by the daemon; the
//! driver reads a handful of typed keys out of it. The refquota and
//! remove-snapshots preferences are resolved per call, pool config first
//! and volume config second.

use crate::error::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parse the daemon's truthiness convention.
pub fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Configuration of one storage pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name as known to the daemon.
    pub name: String,
    /// Raw configuration map.
    pub config: HashMap<String, String>,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    /// The ZFS dataset prefix backing this pool. Equals `zfs.pool_name`
    /// when the pool was adopted from an existing dataset, else the pool
    /// name itself.
    pub fn on_disk_name(&self) -> &str {
        match self.config.get("zfs.pool_name") {
            Some(name) if !name.is_empty() => name,
            _ => &self.name,
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.config.get("source").map(String::as_str)
    }

    /// Whether copies use clone-of-snapshot. Defaults to true; only an
    /// explicit falsy `zfs.clone_copy` switches to send/receive.
    pub fn clone_copy(&self) -> bool {
        match self.config.get("zfs.clone_copy") {
            Some(value) if !value.is_empty() => is_true(value),
            _ => true,
        }
    }

    pub fn rsync_bwlimit(&self) -> Option<&str> {
        self.config
            .get("rsync.bwlimit")
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn bool_key(&self, key: &str) -> Option<bool> {
        self.config
            .get(key)
            .filter(|v| !v.is_empty())
            .map(|v| is_true(v))
    }

    pub fn volume_use_refquota(&self) -> Option<bool> {
        self.bool_key("volume.zfs.use_refquota")
    }

    pub fn volume_remove_snapshots(&self) -> Option<bool> {
        self.bool_key("volume.zfs.remove_snapshots")
    }
}

/// Configuration of one storage volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub config: HashMap<String, String>,
}

impl VolumeConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HashMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.config.insert(key.to_string(), value.to_string());
        self
    }

    fn bool_key(&self, key: &str) -> Option<bool> {
        self.config
            .get(key)
            .filter(|v| !v.is_empty())
            .map(|v| is_true(v))
    }

    pub fn use_refquota(&self) -> Option<bool> {
        self.bool_key("zfs.use_refquota")
    }

    pub fn remove_snapshots(&self) -> Option<bool> {
        self.bool_key("zfs.remove_snapshots")
    }
}

/// Resolve the refquota preference: volume config wins over pool config.
pub fn resolve_use_refquota(pool: &PoolConfig, volume: &VolumeConfig) -> bool {
    volume
        .use_refquota()
        .or_else(|| pool.volume_use_refquota())
        .unwrap_or(false)
}

/// Resolve the restore-deletes-newer preference: volume config wins over
/// pool config.
pub fn resolve_remove_snapshots(pool: &PoolConfig, volume: &VolumeConfig) -> bool {
    volume
        .remove_snapshots()
        .or_else(|| pool.volume_remove_snapshots())
        .unwrap_or(false)
}

const IMMUTABLE_POOL_KEYS: &[&str] = &[
    "size",
    "source",
    "volume.size",
    "volume.block.mount_options",
    "volume.block.filesystem",
    "zfs.pool_name",
];

const IMMUTABLE_VOLUME_KEYS: &[&str] = &["size", "block.mount_options", "block.filesystem"];

/// Reject pool config changes the driver cannot apply. `rsync.bwlimit`
/// requires no on-disk modification and passes silently.
pub fn validate_pool_update(changed: &[String]) -> Result<()> {
    for key in IMMUTABLE_POOL_KEYS {
        if changed.iter().any(|c| c == key) {
            return Err(StorageError::invalid_config(format!(
                "the \"{}\" property cannot be changed",
                key
            )));
        }
    }
    Ok(())
}

/// Reject volume config changes the driver cannot apply.
pub fn validate_volume_update(changed: &[String]) -> Result<()> {
    for key in IMMUTABLE_VOLUME_KEYS {
        if changed.iter().any(|c| c == key) {
            return Err(StorageError::invalid_config(format!(
                "the \"{}\" property cannot be changed",
                key
            )));
        }
    }
    Ok(())
}
