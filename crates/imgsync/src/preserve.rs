//! Parent directory mtime preservation.
//!
//! Creating or removing a child bumps its parent directory's mtime. The
//! archive's desired mtime for a directory is applied when the directory
//! entry itself is processed, which comes before its children, so every
//! later change under it would clobber that value.
//!
//! [`PreservedDir`] tracks a single directory. Before the reconciler mutates
//! anything it calls [`PreservedDir::open`] with the parent of the affected
//! path. If that is a different directory than the one currently tracked,
//! the tracked directory's captured mtime is written back and the new parent
//! is captured. A final [`PreservedDir::flush`] restores the last one.
//!
//! Archives list a directory's children together, so one slot covers the
//! common case without caching every directory on the partition.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::disk::DiskFs;
use crate::error::{Result, SyncError};

/// Single-slot parent directory mtime tracker.
#[derive(Debug, Default)]
pub struct PreservedDir {
    current: Option<(PathBuf, SystemTime)>,
}

impl PreservedDir {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The directory currently tracked, if any.
    pub fn current(&self) -> Option<&Path> {
        self.current.as_ref().map(|(p, _)| p.as_path())
    }

    /// Start tracking `dir`, restoring the previously tracked directory if it
    /// differs.
    ///
    /// A `dir` that does not exist is not tracked; the previous directory is
    /// still restored.
    pub fn open<F: DiskFs + ?Sized>(&mut self, fs: &mut F, dir: &Path) -> Result<()> {
        if self.current() == Some(dir) {
            return Ok(());
        }
        self.flush(fs)?;

        let meta = fs
            .lstat(dir)
            .map_err(|e| SyncError::disk("stat", dir, e))?;
        if let Some(meta) = meta {
            tracing::trace!("tracking mtime of {}", dir.display());
            self.current = Some((dir.to_path_buf(), meta.mtime));
        }
        Ok(())
    }

    /// Restore the tracked directory's captured mtime and stop tracking it.
    pub fn flush<F: DiskFs + ?Sized>(&mut self, fs: &mut F) -> Result<()> {
        let Some((dir, mtime)) = self.current.take() else {
            return Ok(());
        };
        tracing::trace!("restoring mtime of {}", dir.display());
        fs.set_times(&dir, mtime, mtime)
            .map_err(|e| SyncError::disk("chtimes", dir, e))
    }

    /// Record that `path` was explicitly given `mtime`.
    ///
    /// When `path` is the tracked directory the new value replaces the
    /// captured one, so the flush does not undo it.
    pub fn retime(&mut self, path: &Path, mtime: SystemTime) {
        if let Some((dir, captured)) = &mut self.current
            && *dir == *path
        {
            *captured = mtime;
        }
    }
}
