#![forbid(unsafe_code)]
//! Reconcile a mounted disk partition against a tar archive.
//!
//! This library imports container-image filesystem contents onto a raw disk
//! partition. Given a tar stream describing the desired state and a handle to
//! the mounted partition, it applies the smallest set of filesystem changes
//! that makes the partition match the archive, and reports every change.
//!
//! # Overview
//!
//! A sync run is a single forward pass over the archive:
//!
//! 1. The partition is enumerated into an [`Inventory`].
//! 2. Each archive entry is materialized (created, replaced or kept), then its
//!    ownership, permission bits and mtime are reconciled.
//! 3. Paths the archive never mentioned are deleted.
//!
//! Parent directory mtimes are preserved across the changes made beneath
//! them (see [`preserve`]), hard links keep their inode identity, and regular
//! files whose size and mtime already match are not rewritten.
//!
//! # Key Features
//!
//! - **Capability-based disk access**: [`DirFs`] resolves every path through
//!   a `cap_std::fs::Dir` handle for the partition root
//! - **Pluggable filesystem**: the reconciler runs against any [`DiskFs`];
//!   [`MemFs`] is an in-memory implementation for tests
//! - **Change stream**: observers receive one [`PathUpdate`] per changed path
//! - **Idempotent**: a second run against the same archive changes nothing
//!
//! # Example
//!
//! ```no_run
//! use imgsync::{DirFs, Reconciler};
//!
//! let mut disk = DirFs::open_mountpoint("/mnt/rootfs")?;
//! let archive = std::fs::File::open("rootfs.tar")?;
//!
//! let stats = Reconciler::new(&mut disk)
//!     .with_observer(|u: &imgsync::PathUpdate| println!("{u}"))
//!     .run(archive)?;
//! eprintln!("{stats}");
//! # Ok::<(), imgsync::SyncError>(())
//! ```
//!
//! # Command-Line Tool
//!
//! The crate ships an `imgsync` binary:
//! ```bash
//! # Sync a partition from an exported rootfs tarball
//! imgsync sync /mnt/rootfs --tar rootfs.tar
//!
//! # Stream the archive from another tool
//! guestfish ... tar-out / - | imgsync sync /mnt/rootfs
//!
//! # List what is on the partition
//! imgsync inventory /mnt/rootfs --format json
//! ```

// Filesystem access
pub mod dirfs;
pub mod disk;
pub mod inventory;
pub mod memfs;

// Archive model
pub mod archive;

// Reconciliation
pub mod preserve;
pub mod sync;
pub mod update;

// Settings and errors
pub mod config;
pub mod error;

// Re-export commonly used types
pub use archive::{ArchiveEntry, EntryKind, normalize_path};
pub use config::{OrderCheck, SyncConfig};
pub use dirfs::DirFs;
pub use disk::{DiskFs, FileKind, Metadata};
pub use error::{Result, SyncError};
pub use inventory::Inventory;
pub use memfs::MemFs;
pub use preserve::PreservedDir;
pub use sync::{Reconciler, SyncOptions, SyncStats};
pub use update::{PathUpdate, SyncObserver, Update};
