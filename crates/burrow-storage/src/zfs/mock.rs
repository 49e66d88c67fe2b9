//! In-memory ZFS engine for tests.
//!
//! Tracks the dataset graph — properties, snapshot chains in creation
//! order, clone origin edges, and per-dataset file contents — so lifecycle
//! and copy/migration behaviour can be asserted without a real pool.
//! Send/receive serialise dataset state as JSON over the byte stream,
//! which makes stream round-trips observable end to end.

use super::{ZfsEngine, ZfsSink, ZfsStream};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamPayload {
    snapshot: String,
    contents: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
struct SnapshotState {
    name: String,
    contents: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
struct DatasetState {
    properties: BTreeMap<String, String>,
    origin: Option<String>,
    contents: BTreeMap<String, String>,
    snapshots: Vec<SnapshotState>,
}

#[derive(Debug, Default)]
struct MockState {
    datasets: BTreeMap<String, DatasetState>,
    mounted: HashSet<String>,
    mount_calls: Vec<String>,
    imported_pools: Vec<String>,
}

impl MockState {
    fn dataset(&self, name: &str) -> Result<&DatasetState> {
        self.datasets
            .get(name)
            .ok_or_else(|| StorageError::dataset_not_found(name))
    }

    fn dataset_mut(&mut self, name: &str) -> Result<&mut DatasetState> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| StorageError::dataset_not_found(name))
    }

    fn create_with_parents(&mut self, name: &str) {
        let mut path = String::new();
        for part in name.split('/') {
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(part);
            self.datasets.entry(path.clone()).or_default();
        }
    }

    /// Datasets whose origin is `dataset@snap`.
    fn clones_of(&self, dataset: &str, snap: &str) -> Vec<String> {
        let qualified = format!("{}@{}", dataset, snap);
        self.datasets
            .iter()
            .filter(|(_, state)| state.origin.as_deref() == Some(qualified.as_str()))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn rewrite_origins(&mut self, from: &str, to: &str) {
        let snap_prefix = format!("{}@", from);
        let child_prefix = format!("{}/", from);
        for state in self.datasets.values_mut() {
            if let Some(origin) = state.origin.as_mut() {
                if let Some(rest) = origin.strip_prefix(&snap_prefix) {
                    *origin = format!("{}@{}", to, rest);
                } else if let Some(rest) = origin.strip_prefix(&child_prefix) {
                    *origin = format!("{}/{}", to, rest);
                }
            }
        }
    }
}

/// In-memory [`ZfsEngine`] used by the test suite.
pub struct MockZfsEngine {
    state: Arc<Mutex<MockState>>,
    mount_delay: Option<Duration>,
}

impl Default for MockZfsEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockZfsEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            mount_delay: None,
        }
    }

    /// Slow down mount calls so concurrency races become observable.
    pub fn with_mount_delay(mut self, delay: Duration) -> Self {
        self.mount_delay = Some(delay);
        self
    }

    pub fn write_file(&self, dataset: &str, path: &str, data: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(ds) = state.datasets.get_mut(dataset) {
            ds.contents.insert(path.to_string(), data.to_string());
        }
    }

    pub fn read_file(&self, dataset: &str, path: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.datasets.get(dataset)?.contents.get(path).cloned()
    }

    pub fn contents_of(&self, dataset: &str) -> BTreeMap<String, String> {
        let state = self.state.lock().unwrap();
        state
            .datasets
            .get(dataset)
            .map(|ds| ds.contents.clone())
            .unwrap_or_default()
    }

    pub fn has_dataset(&self, name: &str) -> bool {
        self.state.lock().unwrap().datasets.contains_key(name)
    }

    pub fn datasets_with_prefix(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .datasets
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn snapshot_labels(&self, dataset: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .datasets
            .get(dataset)
            .map(|ds| ds.snapshots.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn origin_of(&self, dataset: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.datasets.get(dataset)?.origin.clone()
    }

    pub fn property(&self, dataset: &str, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.datasets.get(dataset)?.properties.get(key).cloned()
    }

    pub fn is_mounted(&self, dataset: &str) -> bool {
        self.state.lock().unwrap().mounted.contains(dataset)
    }

    pub fn mount_call_count(&self, dataset: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .mount_calls
            .iter()
            .filter(|name| name.as_str() == dataset)
            .count()
    }

    pub fn imported_pools(&self) -> Vec<String> {
        self.state.lock().unwrap().imported_pools.clone()
    }

    fn apply_receive(
        state: &Arc<Mutex<MockState>>,
        target: &str,
        force: bool,
        payload: StreamPayload,
    ) -> Result<()> {
        let (dataset, target_snap) = match target.split_once('@') {
            Some((dataset, snap)) => (dataset.to_string(), Some(snap.to_string())),
            None => (target.to_string(), None),
        };

        let mut state = state.lock().unwrap();
        state.create_with_parents(&dataset);
        let ds = state.dataset_mut(&dataset)?;

        // The stream names its own snapshot; a receive target with an
        // explicit @name overrides it, mirroring zfs receive.
        let snap_name = target_snap.unwrap_or(payload.snapshot);
        if ds.snapshots.iter().any(|s| s.name == snap_name) {
            if !force {
                return Err(StorageError::dataset_exists(format!(
                    "{}@{}",
                    dataset, snap_name
                )));
            }
            ds.snapshots.retain(|s| s.name != snap_name);
        }

        ds.contents = payload.contents.clone();
        ds.snapshots.push(SnapshotState {
            name: snap_name,
            contents: payload.contents,
        });
        Ok(())
    }
}

#[async_trait]
impl ZfsEngine for MockZfsEngine {
    async fn create(&self, dataset: &str, props: &[(&str, &str)]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.datasets.contains_key(dataset) {
            return Err(StorageError::dataset_exists(dataset));
        }
        state.create_with_parents(dataset);
        let ds = state.dataset_mut(dataset)?;
        for (key, value) in props {
            ds.properties.insert(key.to_string(), value.to_string());
        }
        debug!("Mock: created dataset {}", dataset);
        Ok(())
    }

    async fn destroy(&self, dataset: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset(dataset)?;

        let child_prefix = format!("{}/", dataset);
        let doomed: Vec<String> = state
            .datasets
            .keys()
            .filter(|name| name.as_str() == dataset || name.starts_with(&child_prefix))
            .cloned()
            .collect();

        // A snapshot pinned by a clone outside the destroyed subtree
        // refuses the whole destroy, as zfs does.
        for name in &doomed {
            let snaps: Vec<String> = state.datasets[name]
                .snapshots
                .iter()
                .map(|s| s.name.clone())
                .collect();
            for snap in snaps {
                let pinned = state
                    .clones_of(name, &snap)
                    .into_iter()
                    .any(|clone| !doomed.iter().any(|d| d == &clone));
                if pinned {
                    return Err(StorageError::dataset_has_clones(dataset));
                }
            }
        }

        for name in doomed {
            state.datasets.remove(&name);
            state.mounted.remove(&name);
        }
        debug!("Mock: destroyed dataset {}", dataset);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset(from)?;
        if state.datasets.contains_key(to) {
            return Err(StorageError::dataset_exists(to));
        }

        if let Some((parent, _)) = to.rsplit_once('/') {
            state.create_with_parents(parent);
        }

        let child_prefix = format!("{}/", from);
        let moved: Vec<String> = state
            .datasets
            .keys()
            .filter(|name| name.as_str() == from || name.starts_with(&child_prefix))
            .cloned()
            .collect();
        for old in moved {
            let new = format!("{}{}", to, &old[from.len()..]);
            let ds = state.datasets.remove(&old).unwrap();
            state.datasets.insert(new.clone(), ds);
            if state.mounted.remove(&old) {
                state.mounted.insert(new);
            }
        }
        state.rewrite_origins(from, to);
        debug!("Mock: renamed dataset {} -> {}", from, to);
        Ok(())
    }

    async fn snapshot(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ds = state.dataset_mut(dataset)?;
        if ds.snapshots.iter().any(|s| s.name == snap) {
            return Err(StorageError::dataset_exists(format!("{}@{}", dataset, snap)));
        }
        let contents = ds.contents.clone();
        ds.snapshots.push(SnapshotState {
            name: snap.to_string(),
            contents,
        });
        Ok(())
    }

    async fn snapshot_destroy(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dataset(dataset)?;
        if !state.clones_of(dataset, snap).is_empty() {
            return Err(StorageError::dataset_has_clones(format!(
                "{}@{}",
                dataset, snap
            )));
        }
        let ds = state.dataset_mut(dataset)?;
        let before = ds.snapshots.len();
        ds.snapshots.retain(|s| s.name != snap);
        if ds.snapshots.len() == before {
            return Err(StorageError::dataset_not_found(format!(
                "{}@{}",
                dataset, snap
            )));
        }
        Ok(())
    }

    async fn snapshot_rename(&self, dataset: &str, old: &str, new: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ds = state.dataset_mut(dataset)?;
        let snap = ds
            .snapshots
            .iter_mut()
            .find(|s| s.name == old)
            .ok_or_else(|| StorageError::dataset_not_found(format!("{}@{}", dataset, old)))?;
        snap.name = new.to_string();

        let from = format!("{}@{}", dataset, old);
        let to = format!("{}@{}", dataset, new);
        for entry in state.datasets.values_mut() {
            if entry.origin.as_deref() == Some(from.as_str()) {
                entry.origin = Some(to.clone());
            }
        }
        Ok(())
    }

    async fn clone_snapshot(
        &self,
        origin: &str,
        origin_snap: &str,
        target: &str,
        mountpoint: &Path,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let contents = {
            let ds = state.dataset(origin)?;
            ds.snapshots
                .iter()
                .find(|s| s.name == origin_snap)
                .map(|s| s.contents.clone())
                .ok_or_else(|| {
                    StorageError::dataset_not_found(format!("{}@{}", origin, origin_snap))
                })?
        };
        if state.datasets.contains_key(target) {
            return Err(StorageError::dataset_exists(target));
        }
        state.create_with_parents(target);
        let ds = state.dataset_mut(target)?;
        ds.origin = Some(format!("{}@{}", origin, origin_snap));
        ds.contents = contents;
        ds.properties
            .insert("mountpoint".to_string(), mountpoint.display().to_string());
        ds.properties
            .insert("canmount".to_string(), "noauto".to_string());
        Ok(())
    }

    async fn rollback(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ds = state.dataset_mut(dataset)?;
        match ds.snapshots.last() {
            Some(last) if last.name == snap => {
                ds.contents = last.contents.clone();
                Ok(())
            }
            Some(_) => Err(StorageError::command_failed(
                format!("zfs rollback {}@{}", dataset, snap),
                1,
                "more recent snapshots or bookmarks exist",
            )),
            None => Err(StorageError::dataset_not_found(format!(
                "{}@{}",
                dataset, snap
            ))),
        }
    }

    async fn rollback_destroy(&self, dataset: &str, snap: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ds = state.dataset_mut(dataset)?;
        let idx = ds
            .snapshots
            .iter()
            .position(|s| s.name == snap)
            .ok_or_else(|| StorageError::dataset_not_found(format!("{}@{}", dataset, snap)))?;
        ds.contents = ds.snapshots[idx].contents.clone();
        ds.snapshots.truncate(idx + 1);
        Ok(())
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let ds = state.dataset_mut(dataset)?;
        ds.properties.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_property(&self, entity: &str, key: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        if let Some((dataset, snap)) = entity.split_once('@') {
            let ds = state.dataset(dataset)?;
            if !ds.snapshots.iter().any(|s| s.name == snap) {
                return Err(StorageError::dataset_not_found(entity));
            }
            return Ok(match key {
                "clones" => {
                    let clones = state.clones_of(dataset, snap);
                    if clones.is_empty() {
                        "-".to_string()
                    } else {
                        clones.join(",")
                    }
                }
                _ => "-".to_string(),
            });
        }

        let ds = state.dataset(entity)?;
        Ok(match key {
            "origin" => ds.origin.clone().unwrap_or_else(|| "-".to_string()),
            "used" | "usedbydataset" => ds
                .contents
                .values()
                .map(|data| data.len() as u64)
                .sum::<u64>()
                .to_string(),
            "mountpoint" => ds
                .properties
                .get(key)
                .cloned()
                .unwrap_or_else(|| "none".to_string()),
            "canmount" => ds
                .properties
                .get(key)
                .cloned()
                .unwrap_or_else(|| "on".to_string()),
            _ => ds
                .properties
                .get(key)
                .cloned()
                .unwrap_or_else(|| "-".to_string()),
        })
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let ds = state.dataset(dataset)?;
        Ok(ds.snapshots.iter().map(|s| s.name.clone()).collect())
    }

    async fn exists(&self, entity: &str) -> bool {
        let state = self.state.lock().unwrap();
        match entity.split_once('@') {
            Some((dataset, snap)) => state
                .datasets
                .get(dataset)
                .map(|ds| ds.snapshots.iter().any(|s| s.name == snap))
                .unwrap_or(false),
            None => state.datasets.contains_key(entity),
        }
    }

    async fn mount(&self, dataset: &str, _mountpoint: &Path) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.dataset(dataset)?;
            state.mount_calls.push(dataset.to_string());
        }
        if let Some(delay) = self.mount_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if !state.mounted.insert(dataset.to_string()) {
            return Err(StorageError::dataset_busy(dataset));
        }
        Ok(())
    }

    async fn unmount(&self, dataset: &str, _mountpoint: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.mounted.remove(dataset) {
            return Err(StorageError::command_failed(
                format!("zfs unmount {}", dataset),
                1,
                format!("cannot unmount '{}': not currently mounted", dataset),
            ));
        }
        Ok(())
    }

    async fn send(&self, source: &str, _incremental_from: Option<&str>) -> Result<ZfsStream> {
        let payload = {
            let state = self.state.lock().unwrap();
            let (dataset, snap) = source.split_once('@').ok_or_else(|| {
                StorageError::internal(format!("mock send of non-snapshot {}", source))
            })?;
            let ds = state.dataset(dataset)?;
            let snapshot = ds
                .snapshots
                .iter()
                .find(|s| s.name == snap)
                .ok_or_else(|| StorageError::dataset_not_found(source))?;
            StreamPayload {
                snapshot: snap.to_string(),
                contents: snapshot.contents.clone(),
            }
        };

        let bytes =
            serde_json::to_vec(&payload).map_err(|e| StorageError::internal(e.to_string()))?;
        let (mut tx, rx) = tokio::io::duplex(1 << 20);
        let handle = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&bytes)
                .await
                .map_err(|e| StorageError::io("mock send pipe", e))?;
            tx.shutdown().await.ok();
            Ok(())
        });

        let done = Box::pin(async move {
            handle
                .await
                .map_err(|e| StorageError::internal(e.to_string()))?
        });
        Ok(ZfsStream::new(Box::new(rx), done))
    }

    async fn receive(&self, target: &str, force: bool, _keep_unmounted: bool) -> Result<ZfsSink> {
        let (tx, mut rx) = tokio::io::duplex(1 << 20);
        let state = self.state.clone();
        let target = target.to_string();
        let handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            rx.read_to_end(&mut buf)
                .await
                .map_err(|e| StorageError::io("mock receive pipe", e))?;
            let payload: StreamPayload = serde_json::from_slice(&buf)
                .map_err(|e| StorageError::stream_failed("mock receive", e.to_string()))?;
            Self::apply_receive(&state, &target, force, payload)
        });

        let done = Box::pin(async move {
            handle
                .await
                .map_err(|e| StorageError::internal(e.to_string()))?
        });
        Ok(ZfsSink::new(Box::new(tx), done))
    }

    async fn pool_import(&self, pool: &str, _disks_dir: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.imported_pools.push(pool.to_string());
        state.create_with_parents(pool);
        Ok(())
    }

    async fn pool_destroy(&self, on_disk_name: &str) -> Result<()> {
        self.destroy(on_disk_name).await
    }

    async fn module_version(&self) -> Result<String> {
        Ok("2.1.99-mock".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_dataset_lifecycle() {
        let zfs = MockZfsEngine::new();
        zfs.create("pool1/containers/ct1", &[("mountpoint", "none")])
            .await
            .unwrap();
        assert!(zfs.exists("pool1/containers/ct1").await);
        assert_eq!(
            zfs.get_property("pool1/containers/ct1", "mountpoint")
                .await
                .unwrap(),
            "none"
        );

        zfs.destroy("pool1/containers/ct1").await.unwrap();
        assert!(!zfs.exists("pool1/containers/ct1").await);
    }

    #[tokio::test]
    async fn test_clone_pins_snapshot() {
        let zfs = MockZfsEngine::new();
        zfs.create("pool1/images/abc", &[]).await.unwrap();
        zfs.snapshot("pool1/images/abc", "readonly").await.unwrap();
        zfs.clone_snapshot(
            "pool1/images/abc",
            "readonly",
            "pool1/containers/ct1",
            Path::new("/tmp/ct1"),
        )
        .await
        .unwrap();

        assert_eq!(
            zfs.get_property("pool1/images/abc@readonly", "clones")
                .await
                .unwrap(),
            "pool1/containers/ct1"
        );
        assert!(zfs.destroy("pool1/images/abc").await.is_err());

        zfs.destroy("pool1/containers/ct1").await.unwrap();
        assert!(zfs.destroy("pool1/images/abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_rewrites_origins() {
        let zfs = MockZfsEngine::new();
        zfs.create("pool1/containers/ct1", &[]).await.unwrap();
        zfs.snapshot("pool1/containers/ct1", "snapshot-s1")
            .await
            .unwrap();
        zfs.clone_snapshot(
            "pool1/containers/ct1",
            "snapshot-s1",
            "pool1/containers/ct2",
            Path::new("/tmp/ct2"),
        )
        .await
        .unwrap();

        zfs.rename("pool1/containers/ct1", "pool1/deleted/containers/xyz")
            .await
            .unwrap();
        assert_eq!(
            zfs.origin_of("pool1/containers/ct2").unwrap(),
            "pool1/deleted/containers/xyz@snapshot-s1"
        );
    }

    #[tokio::test]
    async fn test_rollback_requires_latest() {
        let zfs = MockZfsEngine::new();
        zfs.create("pool1/containers/ct1", &[]).await.unwrap();
        zfs.write_file("pool1/containers/ct1", "etc/hostname", "one");
        zfs.snapshot("pool1/containers/ct1", "snapshot-s1")
            .await
            .unwrap();
        zfs.write_file("pool1/containers/ct1", "etc/hostname", "two");
        zfs.snapshot("pool1/containers/ct1", "snapshot-s2")
            .await
            .unwrap();

        assert!(zfs
            .rollback("pool1/containers/ct1", "snapshot-s1")
            .await
            .is_err());

        zfs.snapshot_destroy("pool1/containers/ct1", "snapshot-s2")
            .await
            .unwrap();
        zfs.rollback("pool1/containers/ct1", "snapshot-s1")
            .await
            .unwrap();
        assert_eq!(
            zfs.read_file("pool1/containers/ct1", "etc/hostname")
                .unwrap(),
            "one"
        );
    }

    #[tokio::test]
    async fn test_send_receive_round_trip() {
        let zfs = MockZfsEngine::new();
        zfs.create("pool1/containers/src", &[]).await.unwrap();
        zfs.write_file("pool1/containers/src", "root/data", "payload");
        zfs.snapshot("pool1/containers/src", "snapshot-s1")
            .await
            .unwrap();

        let mut stream = zfs
            .send("pool1/containers/src@snapshot-s1", None)
            .await
            .unwrap();
        let mut sink = zfs
            .receive("pool1/containers/dst@snapshot-s1", true, true)
            .await
            .unwrap();

        tokio::io::copy(stream.reader(), sink.writer()).await.unwrap();
        sink.writer().shutdown().await.unwrap();
        stream.finish().await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(
            zfs.read_file("pool1/containers/dst", "root/data").unwrap(),
            "payload"
        );
        assert_eq!(
            zfs.snapshot_labels("pool1/containers/dst"),
            vec!["snapshot-s1".to_string()]
        );
    }
}
