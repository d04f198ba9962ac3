//! Error types for the imgsync library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, SyncError>`.
//!
//! # Error Categories
//!
//! - **Archive errors**: [`Archive`], [`UnsupportedEntry`]
//! - **Disk errors**: [`Disk`], [`LinkTarget`], [`NotMounted`]
//! - **Ordering**: [`OutOfOrder`] (only with strict order checking)
//! - **Setup errors**: [`Config`], [`Io`]
//!
//! Every error is fatal for a sync run. The partition is left in whatever
//! state the run had reached; there is no rollback, so callers should sync a
//! copy of the disk image and only publish it once the run has succeeded.
//!
//! [`Archive`]: SyncError::Archive
//! [`UnsupportedEntry`]: SyncError::UnsupportedEntry
//! [`Disk`]: SyncError::Disk
//! [`LinkTarget`]: SyncError::LinkTarget
//! [`NotMounted`]: SyncError::NotMounted
//! [`OutOfOrder`]: SyncError::OutOfOrder
//! [`Config`]: SyncError::Config
//! [`Io`]: SyncError::Io

use std::path::PathBuf;

/// Result type alias for operations that may return a SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error types for sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The archive stream is truncated or a header could not be parsed.
    #[error("failed to read archive: {0}")]
    Archive(#[source] std::io::Error),

    /// An archive entry has a type the reconciler cannot materialize.
    #[error("unsupported entry type {kind} at {}", path.display())]
    UnsupportedEntry {
        /// Normalized path of the entry.
        path: PathBuf,
        /// Human-readable entry type.
        kind: String,
    },

    /// A filesystem operation on the partition failed.
    #[error("failed to {op}: {}: {source}", path.display())]
    Disk {
        /// Name of the failing operation (e.g. "chown").
        op: &'static str,
        /// Path the operation was applied to.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A hard link entry points at a path that does not exist on the partition.
    #[error("hard link target does not exist: {} -> {}", path.display(), target.display())]
    LinkTarget {
        /// Path of the hard link.
        path: PathBuf,
        /// Normalized link target.
        target: PathBuf,
    },

    /// Nothing is mounted at the partition root.
    #[error("nothing mounted at {}", .0.display())]
    NotMounted(PathBuf),

    /// A directory entry arrived after entries nested beneath it.
    #[error("archive lists directory {} after its contents", dir.display())]
    OutOfOrder {
        /// The directory listed late.
        dir: PathBuf,
    },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O error outside of partition operations (e.g. reading a config file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Wrap an I/O error from a partition operation.
    pub(crate) fn disk(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Disk {
            op,
            path: path.into(),
            source,
        }
    }
}
