//! burrow-storage - ZFS copy-on-write storage driver
//!
//! This crate provides:
//! - A per-pool driver for container, image, custom-volume, and snapshot
//!   lifecycles on top of ZFS datasets
//! - Intra-pool copies via clone, full send/receive, or snapshot replay
//! - Source and sink drivers for container migration streams
//! - Pool bootstrap (create/check/import/delete)

pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod migration;
pub mod mountpoint;
pub mod names;
pub mod traits;
pub mod zfs;

mod driver;

// Re-export primary types
pub use config::{PoolConfig, VolumeConfig};
pub use coordinator::{OpKey, OpVerb, OperationMap};
pub use driver::ZfsDriver;
pub use error::{Result, StorageError};
pub use migration::{
    FramedTransport, MigrationFsType, MigrationTransport, ProgressHook, ZfsMigrationSource,
};
pub use names::StorageLayout;
pub use traits::DaemonHooks;
pub use zfs::{MockZfsEngine, ZfsCli, ZfsEngine};
