//! The filesystem capability set the reconciler runs against.
//!
//! [`DiskFs`] abstracts a single mounted partition. Paths passed to it are
//! always absolute and normalized (see [`crate::archive::normalize_path`]);
//! `/` is the root of the partition, not of the host.
//!
//! Two implementations ship with the crate:
//! - [`DirFs`](crate::dirfs::DirFs) over a mounted directory,
//! - [`MemFs`](crate::memfs::MemFs), an in-memory fake used by tests.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::Result;
use crate::inventory::Inventory;

/// Permission bits carried by tar headers and compared against the disk.
pub const PERM_MASK: u32 = 0o7777;

/// Type of a node on the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link.
    Symlink,
    /// Device node, FIFO, socket.
    Other,
}

/// Descriptor returned by [`DiskFs::lstat`] and [`DiskFs::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Node type.
    pub kind: FileKind,
    /// Size in bytes.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
    /// Permission bits (`mode & 0o7777`).
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Inode number. Only meaningful as an equality key within one partition.
    pub ino: u64,
}

impl Metadata {
    /// Returns true for regular files.
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// Returns true for directories.
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    /// Returns true for symbolic links.
    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }
}

/// POSIX-like operations on one mounted partition.
///
/// Queries return `Ok(None)` for absent paths. Mutations fail with the
/// underlying I/O error; the reconciler attaches the path and operation.
///
/// A handle is not safe for concurrent reconciliation passes. Mutating
/// operations take `&mut self`, so holding the handle for a run is enough to
/// serialize access.
pub trait DiskFs {
    /// Query a path without following a final symlink.
    fn lstat(&self, path: &Path) -> io::Result<Option<Metadata>>;

    /// Query a path, following symlinks.
    ///
    /// The reconciler compares hard-link targets with [`DiskFs::lstat`], since
    /// `link(2)` does not follow a symlink. This is for callers that need the
    /// node a path resolves to.
    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>>;

    /// Create a directory with the given permission bits.
    fn mkdir(&mut self, path: &Path, mode: u32) -> io::Result<()>;

    /// Remove a file, symlink, or empty directory.
    fn remove(&mut self, path: &Path) -> io::Result<()>;

    /// Remove a path and everything beneath it. Symlinks are never followed.
    fn remove_all(&mut self, path: &Path) -> io::Result<()>;

    /// Create a hard link at `path` to the existing node at `target`.
    fn link(&mut self, target: &Path, path: &Path) -> io::Result<()>;

    /// Create a symlink at `path` whose contents are `target`.
    fn symlink(&mut self, target: &Path, path: &Path) -> io::Result<()>;

    /// Read a symlink's contents.
    fn readlink(&self, path: &Path) -> io::Result<PathBuf>;

    /// Change ownership, following symlinks.
    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Change ownership of the node itself, never following a symlink.
    fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;

    /// Change permission bits. Never called on symlinks.
    fn chmod(&mut self, path: &Path, mode: u32) -> io::Result<()>;

    /// Set access and modification times without following symlinks.
    fn set_times(&mut self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()>;

    /// Replace the contents of a regular file, creating it if absent.
    ///
    /// Returns the number of bytes written.
    fn write_file(&mut self, path: &Path, content: &mut dyn Read) -> io::Result<u64>;

    /// Enumerate every path on the partition, including ones an ordinary
    /// traversal of the mount would not reach.
    ///
    /// Fails with [`SyncError::NotMounted`](crate::SyncError::NotMounted)
    /// when no partition is mounted at the root.
    fn enumerate_all_paths(&self) -> Result<Inventory>;
}
