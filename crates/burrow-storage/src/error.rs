use miette::Diagnostic;
use thiserror::Error;

/// Error type for storage driver operations
#[derive(Error, Debug, Diagnostic)]
pub enum StorageError {
    /// Dataset not found
    #[error("Dataset not found: {dataset}")]
    #[diagnostic(
        code(burrow::storage::dataset_not_found),
        help("Verify the dataset exists with `zfs list`. It may have been tombstoned under deleted/")
    )]
    DatasetNotFound { dataset: String },

    /// Dataset already exists
    #[error("Dataset already exists: {dataset}")]
    #[diagnostic(
        code(burrow::storage::dataset_exists),
        help("Delete the existing dataset first, or pick a different name")
    )]
    DatasetExists { dataset: String },

    /// Dataset is busy
    #[error("Dataset is busy: {dataset}")]
    #[diagnostic(
        code(burrow::storage::dataset_busy),
        help("Another process holds the dataset or its mountpoint open. Retry once it is released")
    )]
    DatasetBusy { dataset: String },

    /// Dataset has dependent clones
    #[error("Dataset has dependent clones: {dataset}")]
    #[diagnostic(
        code(burrow::storage::dataset_has_clones),
        help("Destroy or promote the clones first. The driver tombstones pinned datasets under deleted/")
    )]
    DatasetHasClones { dataset: String },

    /// Source and target live on different pools
    #[error("Storage pool mismatch: expected \"{expected}\", got \"{actual}\"")]
    #[diagnostic(
        code(burrow::storage::pool_mismatch),
        help("Copying and migrating between different storage pools is not supported by this driver")
    )]
    PoolMismatch { expected: String, actual: String },

    /// Restore target is not the most recent snapshot
    #[error("ZFS can only restore from the latest snapshot: {snapshot}")]
    #[diagnostic(
        code(burrow::storage::snapshot_not_latest),
        help("Delete newer snapshots, enable zfs.remove_snapshots, or copy the snapshot into a new container instead")
    )]
    SnapshotNotLatest { snapshot: String },

    /// A send/receive pipe failed
    #[error("Stream failed during {stage}: {message}")]
    #[diagnostic(
        code(burrow::storage::stream_failed),
        help("Check both ends of the send/receive pipe. The peer's stderr is included in the message")
    )]
    StreamFailed { stage: String, message: String },

    /// Command execution failed
    #[error("Command '{command}' failed with exit code {exit_code}")]
    #[diagnostic(code(burrow::storage::command_failed), help("stderr: {stderr}"))]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// Invalid configuration
    #[error("Invalid storage configuration: {message}")]
    #[diagnostic(
        code(burrow::storage::invalid_config),
        help("Check the pool and volume configuration keys. Some properties cannot be changed after creation")
    )]
    InvalidConfig { message: String },

    /// ZFS tooling or kernel module unavailable
    #[error("ZFS is not usable on this host: {message}")]
    #[diagnostic(
        code(burrow::storage::module_unavailable),
        help("Install the zfs userspace tools and load the zfs kernel module")
    )]
    ModuleUnavailable { message: String },

    /// I/O error
    #[error("I/O error: {message}")]
    #[diagnostic(
        code(burrow::storage::io_error),
        help("Check filesystem permissions and available disk space")
    )]
    Io {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal driver error
    #[error("Internal storage driver error: {message}")]
    #[diagnostic(
        code(burrow::storage::internal_error),
        help("This is likely a bug in burrow-storage. Please report it with the full error details")
    )]
    Internal { message: String },
}

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn dataset_not_found(dataset: impl Into<String>) -> Self {
        Self::DatasetNotFound {
            dataset: dataset.into(),
        }
    }

    pub fn dataset_exists(dataset: impl Into<String>) -> Self {
        Self::DatasetExists {
            dataset: dataset.into(),
        }
    }

    pub fn dataset_busy(dataset: impl Into<String>) -> Self {
        Self::DatasetBusy {
            dataset: dataset.into(),
        }
    }

    pub fn dataset_has_clones(dataset: impl Into<String>) -> Self {
        Self::DatasetHasClones {
            dataset: dataset.into(),
        }
    }

    pub fn pool_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::PoolMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn snapshot_not_latest(snapshot: impl Into<String>) -> Self {
        Self::SnapshotNotLatest {
            snapshot: snapshot.into(),
        }
    }

    pub fn stream_failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StreamFailed {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn command_failed(
        command: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn module_unavailable(message: impl Into<String>) -> Self {
        Self::ModuleUnavailable {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True when the error is the busy condition from a mount or destroy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::DatasetBusy { .. })
    }

    /// True when the error means the entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DatasetNotFound { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}
