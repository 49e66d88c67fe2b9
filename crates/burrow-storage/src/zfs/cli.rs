//! ZFS engine backed by the zfs/zpool user tools.

use super::{classify_failure, ZfsEngine, ZfsSink, ZfsStream};
use crate::command::{exec_unchecked, CommandOutput};
use crate::error::{Result, StorageError};
use crate::mountpoint::is_mount_point;
use async_trait::async_trait;
use rustix::mount::{MountFlags, UnmountFlags};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

const MODULE_VERSION_PATH: &str = "/sys/module/zfs/version";

/// Retry budget for destroy: open fds or lingering kernel references can
/// keep a dataset busy for a short while after unmount.
const DESTROY_ATTEMPTS: u32 = 20;
const DESTROY_RETRY_DELAY: Duration = Duration::from_millis(500);

fn tool_available(name: &str) -> bool {
    let path = match std::env::var_os("PATH") {
        Some(path) => path,
        None => return false,
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// Shelling implementation of [`ZfsEngine`].
pub struct ZfsCli;

impl ZfsCli {
    /// Fails when the `zfs` user tool is not installed.
    pub fn new() -> Result<Self> {
        if !tool_available("zfs") {
            return Err(StorageError::module_unavailable(
                "the \"zfs\" tool is not available",
            ));
        }
        Ok(Self)
    }

    async fn run(&self, entity: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = exec_unchecked("zfs", args).await?;
        if !output.success() {
            return Err(classify_failure(
                entity,
                format!("zfs {}", args.join(" ")),
                output,
            ));
        }
        Ok(output)
    }
}

#[async_trait]
impl ZfsEngine for ZfsCli {
    async fn create(&self, dataset: &str, props: &[(&str, &str)]) -> Result<()> {
        let mut args = vec!["create".to_string(), "-p".to_string()];
        for (key, value) in props {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(dataset.to_string());
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(dataset, &refs).await?;
        Ok(())
    }

    async fn destroy(&self, dataset: &str) -> Result<()> {
        // An actively mounted dataset refuses destroy; detach it first.
        if let Ok(mountpoint) = self.get_property(dataset, "mountpoint").await {
            if mountpoint != "none" && mountpoint != "legacy" && !mountpoint.is_empty() {
                let path = PathBuf::from(&mountpoint);
                if is_mount_point(&path) {
                    let _ = rustix::mount::unmount(&path, UnmountFlags::DETACH);
                }
            }
        }

        let mut last = None;
        for attempt in 0..DESTROY_ATTEMPTS {
            match self.run(dataset, &["destroy", "-r", dataset]).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_busy() => {
                    debug!(
                        "Dataset {} busy on destroy (attempt {}), retrying",
                        dataset,
                        attempt + 1
                    );
                    last = Some(err);
                    tokio::time::sleep(DESTROY_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last.unwrap_or_else(|| StorageError::dataset_busy(dataset)))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.run(from, &["rename", "-p", from, to]).await?;
        Ok(())
    }

    async fn snapshot(&self, dataset: &str, snap: &str) -> Result<()> {
        let qualified = format!("{}@{}", dataset, snap);
        self.run(&qualified, &["snapshot", &qualified]).await?;
        Ok(())
    }

    async fn snapshot_destroy(&self, dataset: &str, snap: &str) -> Result<()> {
        let qualified = format!("{}@{}", dataset, snap);
        self.run(&qualified, &["destroy", &qualified]).await?;
        Ok(())
    }

    async fn snapshot_rename(&self, dataset: &str, old: &str, new: &str) -> Result<()> {
        let from = format!("{}@{}", dataset, old);
        let to = format!("{}@{}", dataset, new);
        self.run(&from, &["rename", &from, &to]).await?;
        Ok(())
    }

    async fn clone_snapshot(
        &self,
        origin: &str,
        origin_snap: &str,
        target: &str,
        mountpoint: &Path,
    ) -> Result<()> {
        let source = format!("{}@{}", origin, origin_snap);
        let mountpoint_prop = format!("mountpoint={}", mountpoint.display());
        self.run(
            target,
            &[
                "clone",
                "-p",
                "-o",
                &mountpoint_prop,
                "-o",
                "canmount=noauto",
                &source,
                target,
            ],
        )
        .await?;
        Ok(())
    }

    async fn rollback(&self, dataset: &str, snap: &str) -> Result<()> {
        let qualified = format!("{}@{}", dataset, snap);
        self.run(&qualified, &["rollback", &qualified]).await?;
        Ok(())
    }

    async fn rollback_destroy(&self, dataset: &str, snap: &str) -> Result<()> {
        let qualified = format!("{}@{}", dataset, snap);
        self.run(&qualified, &["rollback", "-r", "-R", &qualified])
            .await?;
        Ok(())
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", key, value);
        self.run(dataset, &["set", &assignment, dataset]).await?;
        Ok(())
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<String> {
        let output = self
            .run(dataset, &["get", "-H", "-p", "-o", "value", key, dataset])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let output = self
            .run(
                dataset,
                &[
                    "list", "-t", "snapshot", "-d", "1", "-s", "creation", "-o", "name", "-H",
                    dataset,
                ],
            )
            .await?;

        let prefix = format!("{}@", dataset);
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    async fn exists(&self, entity: &str) -> bool {
        match exec_unchecked("zfs", &["get", "-H", "type", entity]).await {
            Ok(output) => output.success(),
            Err(_) => false,
        }
    }

    async fn mount(&self, dataset: &str, mountpoint: &Path) -> Result<()> {
        let data = format!("rw,zfsutil,mntpoint={}", mountpoint.display());
        debug!("Mounting {} at {}", dataset, mountpoint.display());
        rustix::mount::mount(dataset, mountpoint, "zfs", MountFlags::empty(), data.as_str())
            .map_err(|errno| {
                if errno == rustix::io::Errno::BUSY {
                    StorageError::dataset_busy(dataset)
                } else {
                    StorageError::io(
                        format!("failed to mount {} at {}", dataset, mountpoint.display()),
                        std::io::Error::from_raw_os_error(errno.raw_os_error()),
                    )
                }
            })
    }

    async fn unmount(&self, dataset: &str, _mountpoint: &Path) -> Result<()> {
        self.run(dataset, &["unmount", dataset]).await?;
        Ok(())
    }

    async fn send(&self, source: &str, incremental_from: Option<&str>) -> Result<ZfsStream> {
        let mut args = vec!["send".to_string()];
        if let Some(parent) = incremental_from {
            args.push("-i".to_string());
            args.push(parent.to_string());
        }
        args.push(source.to_string());

        debug!("Starting stream source: zfs {}", args.join(" "));
        let mut child = Command::new("zfs")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StorageError::io(format!("failed to spawn zfs {}", args.join(" ")), e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StorageError::internal("zfs send produced no stdout handle"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StorageError::internal("zfs send produced no stderr handle"))?;

        let source = source.to_string();
        let done = Box::pin(async move {
            // Drain stderr before waiting so a chatty sender cannot wedge
            // on a full pipe.
            let mut message = String::new();
            let _ = stderr.read_to_string(&mut message).await;
            let status = child
                .wait()
                .await
                .map_err(|e| StorageError::io("failed to wait for zfs send", e))?;
            if status.success() {
                Ok(())
            } else {
                Err(StorageError::stream_failed(
                    format!("zfs send {}", source),
                    message.trim().to_string(),
                ))
            }
        });

        Ok(ZfsStream::new(Box::new(stdout), done))
    }

    async fn receive(&self, target: &str, force: bool, keep_unmounted: bool) -> Result<ZfsSink> {
        let mut args = vec!["receive".to_string()];
        if force {
            args.push("-F".to_string());
        }
        if keep_unmounted {
            args.push("-u".to_string());
        }
        args.push(target.to_string());

        debug!("Starting stream sink: zfs {}", args.join(" "));
        let mut child = Command::new("zfs")
            .args(&args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StorageError::io(format!("failed to spawn zfs {}", args.join(" ")), e))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| StorageError::internal("zfs receive produced no stdin handle"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| StorageError::internal("zfs receive produced no stderr handle"))?;

        let target = target.to_string();
        let done = Box::pin(async move {
            let mut message = String::new();
            let _ = stderr.read_to_string(&mut message).await;
            let status = child
                .wait()
                .await
                .map_err(|e| StorageError::io("failed to wait for zfs receive", e))?;
            if status.success() {
                Ok(())
            } else {
                Err(StorageError::stream_failed(
                    format!("zfs receive {}", target),
                    message.trim().to_string(),
                ))
            }
        });

        Ok(ZfsSink::new(Box::new(stdin), done))
    }

    async fn pool_import(&self, pool: &str, disks_dir: &Path) -> Result<()> {
        let disks = disks_dir.display().to_string();
        let output = exec_unchecked("zpool", &["import", "-d", &disks, pool]).await?;
        if !output.success() {
            return Err(StorageError::command_failed(
                format!("zpool import -d {} {}", disks, pool),
                output.exit_code,
                output.stderr.trim(),
            ));
        }
        Ok(())
    }

    async fn pool_destroy(&self, on_disk_name: &str) -> Result<()> {
        // An adopted dataset root is destroyed in place; a dedicated pool
        // is torn down wholesale.
        if on_disk_name.contains('/') {
            return self.destroy(on_disk_name).await;
        }
        let output = exec_unchecked("zpool", &["destroy", on_disk_name]).await?;
        if !output.success() {
            return Err(StorageError::command_failed(
                format!("zpool destroy {}", on_disk_name),
                output.exit_code,
                output.stderr.trim(),
            ));
        }
        Ok(())
    }

    async fn module_version(&self) -> Result<String> {
        match tokio::fs::read_to_string(MODULE_VERSION_PATH).await {
            Ok(version) => Ok(version.trim().to_string()),
            Err(_) => Err(StorageError::module_unavailable(
                "could not determine ZFS module version",
            )),
        }
    }
}
