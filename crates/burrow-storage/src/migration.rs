//! Container migration over a byte-stream transport.
//!
//! The source side turns a container and its snapshot chain into a
//! sequence of send streams; the sink side replays them with `receive -F
//! -u` and cleans up the transient snapshots the wire format leaves
//! behind. The websocket (or any other) transport is the daemon's
//! business: the driver only needs something that can carry one complete
//! stream at a time, which [`MigrationTransport`] models. Byte pumps run
//! at 4 MiB granularity.

use crate::driver::ZfsDriver;
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use async_trait::async_trait;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Granularity of the stream pumps.
pub const MIGRATION_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Wire format negotiated with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationFsType {
    /// Native ZFS send streams.
    Zfs,
    /// Plain rsync of the mounted filesystem.
    Rsync,
}

/// Per-stream progress callback, invoked with the number of bytes moved.
pub type ProgressHook = Arc<dyn Fn(u64) + Send + Sync>;

/// One complete stream at a time over the migration wire. Framing is the
/// transport's responsibility; the driver never sees stream boundaries.
#[async_trait]
pub trait MigrationTransport: Send {
    /// Forward one complete send stream to the peer.
    async fn send_stream(&mut self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64>;

    /// Receive one complete stream from the peer into `writer`.
    async fn recv_stream(&mut self, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64>;
}

/// Reference transport: length-prefixed chunks over any duplex byte pipe,
/// a zero-length chunk closing each stream. The daemon's websocket
/// transport provides the same contract with websocket message framing.
pub struct FramedTransport<S> {
    io: S,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> FramedTransport<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            buffer: vec![0; MIGRATION_BUFFER_SIZE],
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin> MigrationTransport for FramedTransport<S> {
    async fn send_stream(&mut self, reader: &mut (dyn AsyncRead + Send + Unpin)) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let n = reader
                .read(&mut self.buffer)
                .await
                .map_err(|e| StorageError::io("migration source pipe", e))?;
            if n == 0 {
                break;
            }
            self.io
                .write_u32(n as u32)
                .await
                .map_err(|e| StorageError::io("migration transport", e))?;
            self.io
                .write_all(&self.buffer[..n])
                .await
                .map_err(|e| StorageError::io("migration transport", e))?;
            total += n as u64;
        }
        self.io
            .write_u32(0)
            .await
            .map_err(|e| StorageError::io("migration transport", e))?;
        self.io
            .flush()
            .await
            .map_err(|e| StorageError::io("migration transport", e))?;
        Ok(total)
    }

    async fn recv_stream(&mut self, writer: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<u64> {
        let mut total = 0u64;
        loop {
            let len = self
                .io
                .read_u32()
                .await
                .map_err(|e| StorageError::io("migration transport", e))? as usize;
            if len == 0 {
                break;
            }
            if len > self.buffer.len() {
                self.buffer.resize(len, 0);
            }
            self.io
                .read_exact(&mut self.buffer[..len])
                .await
                .map_err(|e| StorageError::io("migration transport", e))?;
            writer
                .write_all(&self.buffer[..len])
                .await
                .map_err(|e| StorageError::io("migration sink pipe", e))?;
            total += len as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| StorageError::io("migration sink pipe", e))?;
        Ok(total)
    }
}

/// Source-side migration state for one container.
///
/// Owns the two ephemeral `migration-send-<uuid>` snapshots bridging the
/// live filesystem and the post-checkpoint delta; [`Self::cleanup`] must
/// run once the peer confirmed the transfer.
pub struct ZfsMigrationSource {
    driver: ZfsDriver,
    container: String,
    is_snapshot: bool,
    zfs_snapshot_names: Vec<String>,
    running_snap_name: Option<String>,
    stopped_snap_name: Option<String>,
}

impl ZfsDriver {
    /// Containers migrate with their inodes intact.
    pub fn preserves_inodes(&self) -> bool {
        true
    }

    /// This driver speaks native send streams on the wire.
    pub fn migration_type(&self) -> MigrationFsType {
        MigrationFsType::Zfs
    }

    /// Build the source-side driver for migrating `container`.
    pub async fn migration_source(
        &self,
        container: &str,
        container_only: bool,
    ) -> Result<ZfsMigrationSource> {
        let (parent, snap) = names::split_snapshot_name(container);

        // A snapshot migrates as just that one stream.
        if snap.is_some() {
            return Ok(ZfsMigrationSource {
                driver: self.clone(),
                container: container.to_string(),
                is_snapshot: true,
                zfs_snapshot_names: Vec::new(),
                running_snap_name: None,
                stopped_snap_name: None,
            });
        }

        let mut zfs_snapshot_names = Vec::new();
        if !container_only {
            // Oldest to newest keeps the incremental streams small.
            // Transient migration-send/copy snapshots from concurrent
            // copies are not part of the container's history.
            let labels = self
                .zfs()
                .list_snapshots(&self.dataset(&names::container_fs(parent)))
                .await?;
            zfs_snapshot_names = labels
                .into_iter()
                .filter(|label| names::is_user_snapshot(label))
                .collect();
        }

        Ok(ZfsMigrationSource {
            driver: self.clone(),
            container: container.to_string(),
            is_snapshot: false,
            zfs_snapshot_names,
            running_snap_name: None,
            stopped_snap_name: None,
        })
    }
}

impl ZfsMigrationSource {
    /// On-disk snapshot labels that will be sent, in order.
    pub fn snapshots(&self) -> &[String] {
        &self.zfs_snapshot_names
    }

    async fn send_one(
        &self,
        conn: &mut dyn MigrationTransport,
        label: &str,
        parent_label: Option<&str>,
        progress: Option<&ProgressHook>,
    ) -> Result<()> {
        let (parent, _) = names::split_snapshot_name(&self.container);
        let dataset = self.driver.dataset(&names::container_fs(parent));
        let source = format!("{}@{}", dataset, label);
        let incremental = parent_label.map(|p| format!("{}@{}", dataset, p));

        let mut stream = self
            .driver
            .zfs()
            .send(&source, incremental.as_deref())
            .await?;
        let sent = conn.send_stream(stream.reader()).await;
        let finished = stream.finish().await;

        let sent = sent?;
        finished?;

        if let Some(hook) = progress {
            hook(sent);
        }
        Ok(())
    }

    /// Stream the snapshot chain and then the live filesystem, captured
    /// as a fresh `migration-send-<uuid>` snapshot.
    pub async fn send_while_running(
        &mut self,
        conn: &mut dyn MigrationTransport,
        progress: Option<ProgressHook>,
        container_only: bool,
    ) -> Result<()> {
        if self.is_snapshot {
            let (_, snap) = names::split_snapshot_name(&self.container);
            let label = names::snap_label(snap.unwrap_or_default());
            return self.send_one(conn, &label, None, progress.as_ref()).await;
        }

        let mut last: Option<String> = None;
        if !container_only {
            let labels = self.zfs_snapshot_names.clone();
            for (i, label) in labels.iter().enumerate() {
                let prev = if i > 0 { Some(labels[i - 1].as_str()) } else { None };
                self.send_one(conn, label, prev, progress.as_ref()).await?;
                last = Some(label.clone());
            }
        }

        let running = format!("{}{}", names::MIGRATION_SEND_SNAPSHOT_PREFIX, Uuid::new_v4());
        self.driver
            .zfs()
            .snapshot(
                &self.driver.dataset(&names::container_fs(&self.container)),
                &running,
            )
            .await?;
        self.running_snap_name = Some(running.clone());

        self.send_one(conn, &running, last.as_deref(), progress.as_ref())
            .await
    }

    /// After the container checkpointed, stream the final delta since the
    /// running snapshot.
    pub async fn send_after_checkpoint(&mut self, conn: &mut dyn MigrationTransport) -> Result<()> {
        let stopped = format!("{}{}", names::MIGRATION_SEND_SNAPSHOT_PREFIX, Uuid::new_v4());
        self.driver
            .zfs()
            .snapshot(
                &self.driver.dataset(&names::container_fs(&self.container)),
                &stopped,
            )
            .await?;
        self.stopped_snap_name = Some(stopped.clone());

        self.send_one(conn, &stopped, self.running_snap_name.as_deref(), None)
            .await
    }

    /// Destroy both ephemeral snapshots. Best-effort; failures are
    /// logged, not surfaced.
    pub async fn cleanup(&mut self) {
        let dataset = self.driver.dataset(&names::container_fs(&self.container));

        if let Some(stopped) = self.stopped_snap_name.take() {
            if let Err(err) = self.driver.zfs().snapshot_destroy(&dataset, &stopped).await {
                warn!(
                    "Failed to destroy migration snapshot \"{}@{}\": {}",
                    dataset, stopped, err
                );
            }
        }
        if let Some(running) = self.running_snap_name.take() {
            if let Err(err) = self.driver.zfs().snapshot_destroy(&dataset, &running).await {
                warn!(
                    "Failed to destroy migration snapshot \"{}@{}\": {}",
                    dataset, running, err
                );
            }
        }
    }
}

impl ZfsDriver {
    /// Sink side of a migration: receive the expected snapshots, the live
    /// filesystem, and (for live migrations) the post-checkpoint delta,
    /// then purge the transient snapshots the streams carried in.
    pub async fn migration_sink(
        &self,
        live: bool,
        container: &str,
        expected_snapshots: &[String],
        conn: &mut dyn MigrationTransport,
        progress: Option<ProgressHook>,
        _container_only: bool,
    ) -> Result<()> {
        let dataset = self.dataset(&names::container_fs(container));
        let mount_point = self.layout().container_mount_point(container);

        // receive -F needs the filesystem unmounted, and receiving a
        // snapshot needs the snapshotted filesystem unmounted too.
        if mountpoint::is_mount_point(&mount_point) {
            self.zfs().unmount(&dataset, &mount_point).await?;
        }

        if !expected_snapshots.is_empty() {
            mountpoint::ensure_snapshot_mountpoint(
                &self.layout().snapshots_dir(container),
                &self.layout().snapshot_symlink(container),
            )?;
        }

        // The container's root disk device has to point at this pool.
        let parent_pool = self.hooks().root_disk_pool(container).await?;
        if parent_pool != self.pool().name {
            return Err(StorageError::pool_mismatch(&self.pool().name, parent_pool));
        }

        let receive_result: Result<()> = async {
            for snap in expected_snapshots {
                // Metadata first, so the snapshot record exists before its
                // bytes do.
                self.hooks().create_snapshot_record(container, snap).await?;

                let target = format!("{}@{}", dataset, names::snap_label(snap));
                self.receive_one(conn, &target, progress.as_ref()).await?;

                let mount_dir = self.layout().snapshot_mount_point(container, snap);
                fs::create_dir_all(&mount_dir).map_err(|e| {
                    StorageError::io(format!("failed to create {}", mount_dir.display()), e)
                })?;
                fs::set_permissions(&mount_dir, fs::Permissions::from_mode(0o700)).map_err(
                    |e| StorageError::io(format!("failed to chmod {}", mount_dir.display()), e),
                )?;
            }

            self.receive_one(conn, &dataset, progress.as_ref()).await?;
            if live {
                self.receive_one(conn, &dataset, progress.as_ref()).await?;
            }
            Ok(())
        }
        .await;

        // Drop whatever transient snapshots the streams carried in, even
        // when a receive failed halfway.
        match self.zfs().list_snapshots(&dataset).await {
            Ok(labels) => {
                for label in labels {
                    if !expected_snapshots.is_empty()
                        && !label.starts_with(names::MIGRATION_SEND_SNAPSHOT_PREFIX)
                    {
                        continue;
                    }
                    if let Err(err) = self.zfs().snapshot_destroy(&dataset, &label).await {
                        debug!(
                            "Failed to destroy transient snapshot \"{}@{}\": {}",
                            dataset, label, err
                        );
                    }
                }
            }
            Err(err) => error!("Failed listing snapshots post migration: {}", err),
        }

        receive_result?;

        // receive -u notwithstanding, the filesystem may or may not be
        // mounted at this point; try, but do not complain.
        let _ = self.zfs().mount(&dataset, &mount_point).await;
        Ok(())
    }

    async fn receive_one(
        &self,
        conn: &mut dyn MigrationTransport,
        target: &str,
        progress: Option<&ProgressHook>,
    ) -> Result<()> {
        let mut sink = self.zfs().receive(target, true, true).await?;
        let received = conn.recv_stream(sink.writer()).await;
        let finished = sink.finish().await;

        let received = received?;
        finished?;

        if let Some(hook) = progress {
            hook(received);
        }
        Ok(())
    }
}
