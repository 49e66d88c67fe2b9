//! Shared test harness: a driver wired to the in-memory engine and a
//! recording collaborator.

#![allow(dead_code)]

use async_trait::async_trait;
use burrow_storage::{DaemonHooks, MockZfsEngine, PoolConfig, Result, ZfsDriver};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Records every collaborator call the driver makes.
pub struct RecordingHooks {
    default_pool: String,
    pub unpack_delay: Option<Duration>,
    pub unpack_calls: AtomicUsize,
    pub template_calls: Mutex<Vec<(String, String)>>,
    pub shift_calls: Mutex<Vec<String>>,
    pub image_db: Mutex<Vec<String>>,
    pub rsync_calls: Mutex<Vec<(PathBuf, PathBuf)>>,
    pub snapshot_records: Mutex<HashMap<String, Vec<String>>>,
    pub known_snapshots: Mutex<HashMap<String, Vec<String>>>,
    pub provisioned_pools: Mutex<Vec<String>>,
}

impl RecordingHooks {
    pub fn new(default_pool: &str) -> Self {
        Self {
            default_pool: default_pool.to_string(),
            unpack_delay: None,
            unpack_calls: AtomicUsize::new(0),
            template_calls: Mutex::new(Vec::new()),
            shift_calls: Mutex::new(Vec::new()),
            image_db: Mutex::new(Vec::new()),
            rsync_calls: Mutex::new(Vec::new()),
            snapshot_records: Mutex::new(HashMap::new()),
            known_snapshots: Mutex::new(HashMap::new()),
            provisioned_pools: Mutex::new(Vec::new()),
        }
    }

    pub fn with_unpack_delay(mut self, delay: Duration) -> Self {
        self.unpack_delay = Some(delay);
        self
    }

    /// Seed the daemon-side snapshot metadata for a container.
    pub fn set_snapshots(&self, container: &str, snapshots: &[&str]) {
        self.known_snapshots.lock().unwrap().insert(
            container.to_string(),
            snapshots.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn template_count(&self, container: &str, stage: &str) -> usize {
        self.template_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, s)| c == container && s == stage)
            .count()
    }
}

#[async_trait]
impl DaemonHooks for RecordingHooks {
    async fn template_apply(&self, container: &str, stage: &str) -> Result<()> {
        self.template_calls
            .lock()
            .unwrap()
            .push((container.to_string(), stage.to_string()));
        Ok(())
    }

    async fn shift_rootfs(&self, container: &str) -> Result<()> {
        self.shift_calls.lock().unwrap().push(container.to_string());
        Ok(())
    }

    async fn unpack_image(&self, _fingerprint: &str, _target_dir: &Path) -> Result<()> {
        self.unpack_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.unpack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn image_db_create(&self, fingerprint: &str) -> Result<()> {
        self.image_db.lock().unwrap().push(fingerprint.to_string());
        Ok(())
    }

    async fn image_db_delete(&self, fingerprint: &str) -> Result<()> {
        self.image_db
            .lock()
            .unwrap()
            .retain(|fp| fp != fingerprint);
        Ok(())
    }

    async fn rsync_copy(&self, source: &Path, target: &Path, _bwlimit: Option<&str>) -> Result<()> {
        self.rsync_calls
            .lock()
            .unwrap()
            .push((source.to_path_buf(), target.to_path_buf()));
        Ok(())
    }

    async fn container_snapshots(&self, container: &str) -> Result<Vec<String>> {
        Ok(self
            .known_snapshots
            .lock()
            .unwrap()
            .get(container)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_snapshot_record(&self, container: &str, snapshot: &str) -> Result<()> {
        self.snapshot_records
            .lock()
            .unwrap()
            .entry(container.to_string())
            .or_default()
            .push(snapshot.to_string());
        Ok(())
    }

    async fn root_disk_pool(&self, _container: &str) -> Result<String> {
        Ok(self.default_pool.clone())
    }

    async fn provision_pool(&self, pool: &PoolConfig) -> Result<()> {
        self.provisioned_pools
            .lock()
            .unwrap()
            .push(pool.name.clone());
        Ok(())
    }
}

pub struct Harness {
    pub tmp: TempDir,
    pub zfs: Arc<MockZfsEngine>,
    pub hooks: Arc<RecordingHooks>,
    pub driver: ZfsDriver,
}

impl Harness {
    pub fn new(pool: PoolConfig) -> Self {
        Self::with_engine(pool, MockZfsEngine::new())
    }

    pub fn with_engine(pool: PoolConfig, engine: MockZfsEngine) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let zfs = Arc::new(engine);
        let hooks = Arc::new(RecordingHooks::new(&pool.name));
        let driver = ZfsDriver::new(pool, tmp.path(), zfs.clone(), hooks.clone());
        Self {
            tmp,
            zfs,
            hooks,
            driver,
        }
    }

    pub fn with_hooks(pool: PoolConfig, hooks: RecordingHooks) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let zfs = Arc::new(MockZfsEngine::new());
        let hooks = Arc::new(hooks);
        let driver = ZfsDriver::new(pool, tmp.path(), zfs.clone(), hooks.clone());
        Self {
            tmp,
            zfs,
            hooks,
            driver,
        }
    }
}

/// Harness on a pool whose on-disk dataset prefix differs from the pool
/// name, matching an adopted-dataset setup.
pub fn harness(pool_name: &str, on_disk: &str) -> Harness {
    Harness::new(PoolConfig::new(pool_name).with("zfs.pool_name", on_disk))
}
