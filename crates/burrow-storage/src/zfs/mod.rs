//! The ZFS engine seam.
//!
//! [`ZfsEngine`] exposes one operation per ZFS verb the driver needs. The
//! production implementation ([`ZfsCli`]) shells out to the zfs/zpool user
//! tools; [`MockZfsEngine`] keeps the dataset graph in memory so lifecycle
//! behaviour can be exercised without a pool. Dataset arguments are always
//! full on-disk paths (`<pool>/containers/<name>`); snapshot labels are
//! passed separately.

mod cli;
pub mod mock;

pub use cli::ZfsCli;
pub use mock::MockZfsEngine;

use crate::command::CommandOutput;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

type Done = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A lazy byte stream produced by `zfs send`, with a completion handle
/// that surfaces the sender's exit status and stderr.
pub struct ZfsStream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    done: Done,
}

impl ZfsStream {
    pub fn new(reader: Box<dyn AsyncRead + Send + Unpin>, done: Done) -> Self {
        Self { reader, done }
    }

    pub fn reader(&mut self) -> &mut (dyn AsyncRead + Send + Unpin) {
        &mut self.reader
    }

    /// Release the stream and wait for the sender to finish.
    pub async fn finish(self) -> Result<()> {
        drop(self.reader);
        self.done.await
    }
}

/// A lazy byte sink backed by `zfs receive`, with a completion handle that
/// surfaces the receiver's exit status and stderr.
pub struct ZfsSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    done: Done,
}

impl ZfsSink {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Unpin>, done: Done) -> Self {
        Self { writer, done }
    }

    pub fn writer(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut self.writer
    }

    /// Close the sink (signalling end of stream) and wait for the receiver
    /// to finish.
    pub async fn finish(mut self) -> Result<()> {
        let _ = self.writer.shutdown().await;
        drop(self.writer);
        self.done.await
    }
}

/// One operation per ZFS verb.
#[async_trait]
pub trait ZfsEngine: Send + Sync {
    /// `zfs create -p [-o k=v ...] <dataset>`
    async fn create(&self, dataset: &str, props: &[(&str, &str)]) -> Result<()>;

    /// `zfs destroy -r <dataset>`, force-unmounting first when needed.
    async fn destroy(&self, dataset: &str) -> Result<()>;

    /// `zfs rename -p <from> <to>`
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// `zfs snapshot <dataset>@<snap>`
    async fn snapshot(&self, dataset: &str, snap: &str) -> Result<()>;

    /// `zfs destroy <dataset>@<snap>`
    async fn snapshot_destroy(&self, dataset: &str, snap: &str) -> Result<()>;

    /// `zfs rename <dataset>@<old> <dataset>@<new>`
    async fn snapshot_rename(&self, dataset: &str, old: &str, new: &str) -> Result<()>;

    /// `zfs clone -p -o mountpoint=<mp> -o canmount=noauto <origin>@<snap> <target>`
    async fn clone_snapshot(
        &self,
        origin: &str,
        origin_snap: &str,
        target: &str,
        mountpoint: &Path,
    ) -> Result<()>;

    /// `zfs rollback <dataset>@<snap>` — only valid for the most recent
    /// snapshot.
    async fn rollback(&self, dataset: &str, snap: &str) -> Result<()>;

    /// `zfs rollback -r -R <dataset>@<snap>` — drops newer snapshots and
    /// their clones, used after a full-stream receive.
    async fn rollback_destroy(&self, dataset: &str, snap: &str) -> Result<()>;

    /// `zfs set <key>=<value> <dataset>`
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;

    /// `zfs get -H -p -o value <key> <dataset>`
    async fn get_property(&self, dataset: &str, key: &str) -> Result<String>;

    /// Snapshot labels of `dataset` in creation order.
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>>;

    /// Whether a dataset or `dataset@snapshot` entity exists.
    async fn exists(&self, entity: &str) -> bool;

    /// Mount `dataset` at `mountpoint` (rw, zfsutil).
    async fn mount(&self, dataset: &str, mountpoint: &Path) -> Result<()>;

    /// Unmount `dataset`.
    async fn unmount(&self, dataset: &str, mountpoint: &Path) -> Result<()>;

    /// `zfs send [-i <dataset>@<from>] <dataset>[@snap]`
    async fn send(&self, source: &str, incremental_from: Option<&str>) -> Result<ZfsStream>;

    /// `zfs receive [-F] [-u] <target>`. `keep_unmounted` passes `-u` so
    /// the received filesystem is not auto-mounted.
    async fn receive(&self, target: &str, force: bool, keep_unmounted: bool) -> Result<ZfsSink>;

    /// `zpool import -d <disks_dir> <pool>`
    async fn pool_import(&self, pool: &str, disks_dir: &Path) -> Result<()>;

    /// Destroy the pool's backing entity: `zfs destroy -r` for an adopted
    /// dataset, `zpool destroy` for a whole pool.
    async fn pool_destroy(&self, on_disk_name: &str) -> Result<()>;

    /// Version of the loaded kernel module.
    async fn module_version(&self) -> Result<String>;
}

/// Map a failed zfs invocation to the driver error taxonomy by inspecting
/// stderr.
pub(crate) fn classify_failure(entity: &str, command: String, output: CommandOutput) -> StorageError {
    let stderr = output.stderr.trim();
    if stderr.contains("does not exist") {
        StorageError::dataset_not_found(entity)
    } else if stderr.contains("already exists") {
        StorageError::dataset_exists(entity)
    } else if stderr.contains("is busy") {
        StorageError::dataset_busy(entity)
    } else if stderr.contains("has dependent clones") {
        StorageError::dataset_has_clones(entity)
    } else {
        StorageError::command_failed(command, output.exit_code, stderr)
    }
}
