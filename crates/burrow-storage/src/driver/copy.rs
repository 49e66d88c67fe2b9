//! Intra-pool container copies.
//!
//! Three strategies: a sparse clone of a (possibly ephemeral) snapshot, a
//! full send/receive stream when `zfs.clone_copy` is disabled, and a
//! snapshot-chain replay when the copy keeps the source's history. Source
//! and target must share the pool; the historical no-dataset edge case
//! falls back to rsync.

use super::ZfsDriver;
use crate::error::{Result, StorageError};
use crate::mountpoint;
use crate::names;
use crate::zfs::{ZfsSink, ZfsStream};
use tracing::{debug, warn};
use uuid::Uuid;

/// Drive one send/receive pipeline to completion: pump bytes, wait for
/// the sender, then the receiver, and surface the first failure.
async fn pipe_stream(mut stream: ZfsStream, mut sink: ZfsSink) -> Result<()> {
    let pumped = tokio::io::copy(stream.reader(), sink.writer()).await;
    let send_result = stream.finish().await;
    let recv_result = sink.finish().await;
    pumped.map_err(|e| StorageError::io("send/receive pipe", e))?;
    send_result?;
    recv_result
}

impl ZfsDriver {
    /// Copy `source` (a container, or `parent/snap` for a snapshot) into
    /// a new container volume `target` on the same pool.
    pub async fn container_copy(
        &self,
        target: &str,
        source: &str,
        source_pool: &str,
        privileged: bool,
        container_only: bool,
    ) -> Result<()> {
        debug!("Copying ZFS container storage {} -> {}", source, target);

        if source_pool != self.pool().name {
            return Err(StorageError::pool_mismatch(&self.pool().name, source_pool));
        }

        let (source_parent, source_snap) = names::split_snapshot_name(source);
        let snapshots = if source_snap.is_some() {
            Vec::new()
        } else {
            self.hooks().container_snapshots(source_parent).await?
        };

        if container_only || snapshots.is_empty() {
            if self.pool().clone_copy() {
                self.copy_sparse(target, source, privileged).await?;
            } else {
                self.copy_full(target, source, privileged).await?;
            }
        } else {
            self.copy_with_history(target, source_parent, &snapshots, privileged)
                .await?;
        }

        debug!("Copied ZFS container storage {} -> {}", source, target);
        Ok(())
    }

    /// Clone-of-snapshot copy. A non-snapshot source gets an ephemeral
    /// `copy-<uuid>` snapshot which stays behind as the clone's origin.
    async fn copy_sparse(&self, target: &str, source: &str, privileged: bool) -> Result<()> {
        let (source_parent, snap_only) = names::split_snapshot_name(source);
        let source_fs = names::container_fs(source_parent);

        let mut source_snap = String::new();
        let mut have_source = false;
        let mut ephemeral = false;

        match snap_only {
            Some(snap) => {
                let label = names::snap_label(snap);
                let qualified = format!("{}@{}", self.dataset(&source_fs), label);
                if self.zfs().exists(&qualified).await {
                    source_snap = label;
                    have_source = true;
                }
            }
            None => {
                if self.zfs().exists(&self.dataset(&source_fs)).await {
                    source_snap = format!("{}{}", names::COPY_SNAPSHOT_PREFIX, Uuid::new_v4());
                    self.zfs()
                        .snapshot(&self.dataset(&source_fs), &source_snap)
                        .await?;
                    have_source = true;
                    ephemeral = true;
                }
            }
        }

        if !have_source {
            // No dataset to clone from; build an empty container and let
            // rsync carry the bytes.
            return self.copy_rsync_fallback(target, source_parent, privileged).await;
        }

        if let Err(err) = self
            .copy_sparse_fill(target, &source_fs, &source_snap, privileged)
            .await
        {
            let target_dataset = self.dataset(&names::container_fs(target));
            if self.zfs().exists(&target_dataset).await {
                let _ = self.zfs().destroy(&target_dataset).await;
            }
            let _ = mountpoint::delete_mountpoint(
                &self.layout().container_mount_point(target),
                &self.layout().container_symlink(target),
            );
            if ephemeral {
                let _ = self
                    .zfs()
                    .snapshot_destroy(&self.dataset(&source_fs), &source_snap)
                    .await;
            }
            return Err(err);
        }

        Ok(())
    }

    async fn copy_sparse_fill(
        &self,
        target: &str,
        source_fs: &str,
        source_snap: &str,
        privileged: bool,
    ) -> Result<()> {
        let target_mount_point = self.layout().container_mount_point(target);

        self.zfs()
            .clone_snapshot(
                &self.dataset(source_fs),
                source_snap,
                &self.dataset(&names::container_fs(target)),
                &target_mount_point,
            )
            .await?;

        let our_mount = self.container_mount(target, privileged).await?;
        let result = mountpoint::ensure_container_mountpoint(
            &target_mount_point,
            &self.layout().container_symlink(target),
            privileged,
        );
        if our_mount {
            let _ = self.container_unmount(target).await;
        }
        result?;

        self.hooks().template_apply(target, "copy").await
    }

    async fn copy_rsync_fallback(
        &self,
        target: &str,
        source_parent: &str,
        privileged: bool,
    ) -> Result<()> {
        self.container_create(target, privileged).await?;

        let fill = async {
            self.hooks()
                .rsync_copy(
                    &self.layout().container_symlink(source_parent),
                    &self.layout().container_symlink(target),
                    self.pool().rsync_bwlimit(),
                )
                .await?;
            self.hooks().template_apply(target, "copy").await
        };

        if let Err(err) = fill.await {
            if let Err(cleanup) = self.container_delete(target).await {
                warn!(
                    "Failed to revert rsync copy into \"{}\": {}",
                    target, cleanup
                );
            }
            return Err(err);
        }
        Ok(())
    }

    /// Full send/receive copy used when `zfs.clone_copy` is disabled.
    async fn copy_full(&self, target: &str, source: &str, privileged: bool) -> Result<()> {
        debug!("Creating full ZFS copy \"{}\" -> \"{}\"", source, target);

        let (source_parent, snap_only) = names::split_snapshot_name(source);
        let source_fs = names::container_fs(source_parent);
        let target_dataset = self.dataset(&names::container_fs(target));

        let (snapshot_suffix, ephemeral) = match snap_only {
            Some(snap) => (names::snap_label(snap), false),
            None => {
                let suffix = Uuid::new_v4().to_string();
                self.zfs()
                    .snapshot(&self.dataset(&source_fs), &suffix)
                    .await?;
                (suffix, true)
            }
        };
        let source_dataset = format!("{}@{}", self.dataset(&source_fs), snapshot_suffix);

        let run = async {
            let sink = self.zfs().receive(&target_dataset, false, false).await?;
            let stream = self.zfs().send(&source_dataset, None).await?;
            pipe_stream(stream, sink).await?;

            // Received child snapshots are not wanted in a container-only
            // copy.
            self.zfs()
                .rollback_destroy(&target_dataset, &snapshot_suffix)
                .await?;

            self.zfs()
                .set_property(&target_dataset, "canmount", "noauto")
                .await?;
            let target_mount_point = self.layout().container_mount_point(target);
            self.zfs()
                .set_property(
                    &target_dataset,
                    "mountpoint",
                    &target_mount_point.display().to_string(),
                )
                .await?;

            self.zfs()
                .snapshot_destroy(&target_dataset, &snapshot_suffix)
                .await?;

            let our_mount = self.container_mount(target, privileged).await?;
            let result = mountpoint::ensure_container_mountpoint(
                &target_mount_point,
                &self.layout().container_symlink(target),
                privileged,
            );
            if our_mount {
                let _ = self.container_unmount(target).await;
            }
            result
        }
        .await;

        if ephemeral {
            if let Err(err) = self
                .zfs()
                .snapshot_destroy(&self.dataset(&source_fs), &snapshot_suffix)
                .await
            {
                warn!(
                    "Failed to delete temporary ZFS snapshot \"{}\", manual cleanup needed: {}",
                    source_dataset, err
                );
            }
        }

        run?;
        debug!("Created full ZFS copy \"{}\" -> \"{}\"", source, target);
        Ok(())
    }

    /// Replay the source's snapshot chain onto the target, then stream
    /// the live filesystem incrementally from the last snapshot.
    async fn copy_with_history(
        &self,
        target: &str,
        source_parent: &str,
        snapshots: &[String],
        privileged: bool,
    ) -> Result<()> {
        let target_mount_point = self.layout().container_mount_point(target);
        mountpoint::ensure_container_mountpoint(
            &target_mount_point,
            &self.layout().container_symlink(target),
            privileged,
        )?;
        mountpoint::ensure_snapshot_mountpoint(
            &self.layout().snapshots_dir(target),
            &self.layout().snapshot_symlink(target),
        )?;

        let source_dataset = self.dataset(&names::container_fs(source_parent));
        let target_dataset = self.dataset(&names::container_fs(target));

        let mut previous: Option<&str> = None;
        for snap in snapshots {
            let stream_source = format!("{}@{}", source_dataset, names::snap_label(snap));
            let stream_target = format!("{}@{}", target_dataset, names::snap_label(snap));
            let incremental =
                previous.map(|prev| format!("{}@{}", source_dataset, names::snap_label(prev)));

            let sink = self.zfs().receive(&stream_target, true, false).await?;
            let stream = self
                .zfs()
                .send(&stream_source, incremental.as_deref())
                .await?;
            pipe_stream(stream, sink).await?;

            previous = Some(snap);
        }

        // The live filesystem travels as an ephemeral snapshot
        // incremental from the last replayed one.
        let ephemeral = format!("{}{}", names::COPY_SEND_SNAPSHOT_PREFIX, Uuid::new_v4());
        self.zfs().snapshot(&source_dataset, &ephemeral).await?;

        let incremental =
            previous.map(|prev| format!("{}@{}", source_dataset, names::snap_label(prev)));
        let run = async {
            let sink = self
                .zfs()
                .receive(&format!("{}@{}", target_dataset, ephemeral), true, false)
                .await?;
            let stream = self
                .zfs()
                .send(
                    &format!("{}@{}", source_dataset, ephemeral),
                    incremental.as_deref(),
                )
                .await?;
            pipe_stream(stream, sink).await
        }
        .await;

        let _ = self.zfs().snapshot_destroy(&source_dataset, &ephemeral).await;
        let _ = self.zfs().snapshot_destroy(&target_dataset, &ephemeral).await;
        run?;

        self.zfs()
            .set_property(&target_dataset, "canmount", "noauto")
            .await?;
        self.zfs()
            .set_property(
                &target_dataset,
                "mountpoint",
                &target_mount_point.display().to_string(),
            )
            .await?;

        Ok(())
    }
}
