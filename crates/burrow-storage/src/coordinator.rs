//! Process-wide run-once-per-key coordination.
//!
//! The daemon may issue the same mount, unmount, or image-create operation
//! from several tasks at once. Exactly one caller performs the underlying
//! work; the others wait for its completion signal and then return without
//! re-checking state. The map is process-global and keys embed the pool
//! name, so one instance serves every driver.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;

/// Verb classes that take the coordinator lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpVerb {
    ContainerMount,
    ContainerUmount,
    CustomMount,
    CustomUmount,
    ImageCreate,
}

impl fmt::Display for OpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpVerb::ContainerMount => "container-mount",
            OpVerb::ContainerUmount => "container-umount",
            OpVerb::CustomMount => "custom-mount",
            OpVerb::CustomUmount => "custom-umount",
            OpVerb::ImageCreate => "image-create",
        };
        write!(f, "{}", s)
    }
}

/// Key identifying one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpKey {
    pool: String,
    verb: OpVerb,
    name: String,
}

impl OpKey {
    pub fn new(pool: impl Into<String>, verb: OpVerb, name: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            verb,
            name: name.into(),
        }
    }
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.verb, self.pool, self.name)
    }
}

/// Outcome of [`OperationMap::enter`].
pub enum OpSlot {
    /// This caller owns the operation; dropping the guard signals waiters.
    Acquired(OpGuard),
    /// Another caller owns it; wait on the completion.
    InFlight(Completion),
}

/// Completion handle held by non-acquiring callers.
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// Wait until the owning caller leaves the map.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            // A closed channel means the owner dropped its guard.
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Ownership token for an in-flight operation. Removing the map entry and
/// waking the waiters happens on drop, so the signal fires on both the
/// success and the error path.
pub struct OpGuard {
    map: &'static OperationMap,
    key: OpKey,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut inner = self.map.inner.lock().unwrap();
        if let Some(tx) = inner.remove(&self.key) {
            let _ = tx.send(true);
        }
    }
}

/// The process-wide map from operation key to completion signal.
pub struct OperationMap {
    inner: Mutex<HashMap<OpKey, watch::Sender<bool>>>,
}

static GLOBAL: Lazy<OperationMap> = Lazy::new(|| OperationMap {
    inner: Mutex::new(HashMap::new()),
});

impl OperationMap {
    /// The single process-wide instance.
    pub fn global() -> &'static OperationMap {
        &GLOBAL
    }

    /// Atomically claim `key` or join the in-flight operation.
    pub fn enter(&'static self, key: OpKey) -> OpSlot {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.get(&key) {
            return OpSlot::InFlight(Completion { rx: tx.subscribe() });
        }
        let (tx, _rx) = watch::channel(false);
        inner.insert(key.clone(), tx);
        OpSlot::Acquired(OpGuard { map: self, key })
    }
}
