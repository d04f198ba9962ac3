//! The reconciler: make a partition match a tar archive.
//!
//! A run takes the disk inventory, then walks the archive once. For each
//! entry it creates, replaces or keeps the node at the entry's path, fixes up
//! ownership, permission bits and mtime, reports what changed and strikes
//! the path off the inventory. Whatever the archive did not mention is
//! deleted at the end.
//!
//! # Timestamps
//!
//! Every mutation is preceded by [`PreservedDir::open`] on the parent of the
//! path being changed, and the tracker is flushed once the pass is over, so
//! directory mtimes end up matching the archive even though their contents
//! were rewritten after the directory entry was applied.
//!
//! # Equality
//!
//! Regular files are considered up to date when size and mtime match. The
//! content is never compared.
//!
//! # Example
//!
//! ```
//! use imgsync::memfs::MemFs;
//! use imgsync::sync::Reconciler;
//!
//! let mut disk = MemFs::new();
//! let mut builder = tar::Builder::new(Vec::new());
//! let mut header = tar::Header::new_gnu();
//! header.set_entry_type(tar::EntryType::Directory);
//! header.set_mode(0o755);
//! header.set_uid(0);
//! header.set_gid(0);
//! header.set_size(0);
//! builder.append_data(&mut header, "etc/", std::io::empty())?;
//! let archive = builder.into_inner()?;
//!
//! let mut changes = Vec::new();
//! let stats = Reconciler::new(&mut disk)
//!     .with_observer(|u: &imgsync::PathUpdate| changes.push(u.to_string()))
//!     .run(&archive[..])?;
//! assert_eq!(stats.added, 1);
//! assert_eq!(changes.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::archive::{ArchiveEntry, EntryKind};
use crate::config::OrderCheck;
use crate::disk::{DiskFs, Metadata};
use crate::error::{Result, SyncError};
use crate::inventory::Inventory;
use crate::preserve::PreservedDir;
use crate::update::{PathUpdate, SyncObserver, Update};

/// Tunables for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Handling of directories listed after their contents.
    pub order_check: OrderCheck,
}

/// Counters for a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Archive entries processed.
    pub entries: usize,
    /// Paths created or replaced.
    pub added: usize,
    /// Existing paths whose metadata was adjusted.
    pub modified: usize,
    /// Paths removed because the archive does not list them.
    pub deleted: usize,
    /// Entries that needed no change.
    pub unchanged: usize,
    /// Inventory paths that could not be queried and were left alone.
    pub skipped_unreadable: usize,
    /// File content bytes written.
    pub bytes_written: u64,
    /// Directories listed after entries nested in them.
    pub out_of_order_dirs: usize,
}

impl fmt::Display for SyncStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} entries: {} added, {} modified, {} deleted, {} unchanged, {} bytes written",
            self.entries, self.added, self.modified, self.deleted, self.unchanged, self.bytes_written
        )?;
        if self.skipped_unreadable > 0 {
            write!(f, ", {} unreadable skipped", self.skipped_unreadable)?;
        }
        if self.out_of_order_dirs > 0 {
            write!(f, ", {} directories out of order", self.out_of_order_dirs)?;
        }
        Ok(())
    }
}

/// Outcome of materializing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Materialized {
    /// A new node was created (possibly replacing one of the wrong kind).
    Created,
    /// The existing node was kept.
    Kept,
    /// A hard link already pointed at the right inode.
    LinkIntact,
}

/// Per-run working state.
struct Pass {
    inventory: Inventory,
    preserved: PreservedDir,
    stats: SyncStats,
    /// Parents of every entry processed so far, for the order check.
    parents: HashSet<PathBuf>,
}

/// Applies one archive to one partition.
///
/// The partition handle is borrowed mutably for the reconciler's lifetime,
/// so nothing else can touch the disk while a run is in progress.
pub struct Reconciler<'a, F: DiskFs + ?Sized> {
    fs: &'a mut F,
    observers: Vec<Box<dyn SyncObserver + 'a>>,
    options: SyncOptions,
}

impl<'a, F: DiskFs + ?Sized> Reconciler<'a, F> {
    /// Create a reconciler over `fs` with default options and no observers.
    pub fn new(fs: &'a mut F) -> Self {
        Reconciler {
            fs,
            observers: Vec::new(),
            options: SyncOptions::default(),
        }
    }

    /// Register an observer. Observers are called in registration order.
    pub fn with_observer(mut self, observer: impl SyncObserver + 'a) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Replace the run options.
    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// Reconcile the partition against a tar stream.
    pub fn run<R: Read>(self, reader: R) -> Result<SyncStats> {
        let mut archive = tar::Archive::new(reader);
        self.run_archive(&mut archive)
    }

    /// Reconcile the partition against an already opened archive.
    ///
    /// Returns the first error encountered. Changes made before the error
    /// stay on disk.
    pub fn run_archive<R: Read>(mut self, archive: &mut tar::Archive<R>) -> Result<SyncStats> {
        let inventory = self.fs.enumerate_all_paths()?;
        tracing::debug!("disk inventory holds {} paths", inventory.len());

        let mut pass = Pass {
            inventory,
            preserved: PreservedDir::new(),
            stats: SyncStats::default(),
            parents: HashSet::new(),
        };

        for entry in archive.entries().map_err(SyncError::Archive)? {
            let mut entry = entry.map_err(SyncError::Archive)?;
            let Some(item) = ArchiveEntry::from_tar(&mut entry)? else {
                continue;
            };
            self.apply(&mut pass, &item, &mut entry)?;
        }

        self.delete_remaining(&mut pass)?;
        pass.preserved.flush(&mut *self.fs)?;

        tracing::info!("sync complete: {}", pass.stats);
        Ok(pass.stats)
    }

    fn apply(&mut self, pass: &mut Pass, entry: &ArchiveEntry, content: &mut dyn Read) -> Result<()> {
        let path = entry.path.as_path();
        pass.stats.entries += 1;

        if let EntryKind::Directory = entry.kind {
            self.check_order(pass, path)?;
        }
        if self.options.order_check != OrderCheck::Ignore
            && let Some(parent) = entry.parent()
        {
            pass.parents.insert(parent.to_path_buf());
        }

        let existing = self
            .fs
            .lstat(path)
            .map_err(|e| SyncError::disk("lstat", path, e))?;

        let outcome = self.materialize(pass, entry, existing.as_ref(), content)?;

        let mut update = Update {
            added: outcome == Materialized::Created,
            ..Default::default()
        };

        if outcome != Materialized::LinkIntact {
            let meta = match existing {
                Some(meta) if outcome == Materialized::Kept => meta,
                _ => self
                    .fs
                    .lstat(path)
                    .map_err(|e| SyncError::disk("lstat", path, e))?
                    .ok_or_else(|| {
                        SyncError::disk("lstat", path, io::Error::from(io::ErrorKind::NotFound))
                    })?,
            };
            self.reconcile_metadata(pass, entry, &meta, &mut update)?;
        }

        if update.added {
            pass.stats.added += 1;
        } else if update.is_empty() {
            pass.stats.unchanged += 1;
        } else {
            pass.stats.modified += 1;
        }

        self.emit(PathUpdate {
            path: entry.path.clone(),
            update,
        });
        pass.inventory.remove(path);
        Ok(())
    }

    fn check_order(&mut self, pass: &mut Pass, dir: &Path) -> Result<()> {
        if !pass.parents.contains(dir) {
            return Ok(());
        }
        match self.options.order_check {
            OrderCheck::Ignore => Ok(()),
            OrderCheck::Warn => {
                tracing::warn!(
                    "directory {} listed after its contents; its mtime may not be preserved",
                    dir.display()
                );
                pass.stats.out_of_order_dirs += 1;
                Ok(())
            }
            OrderCheck::Error => Err(SyncError::OutOfOrder {
                dir: dir.to_path_buf(),
            }),
        }
    }

    /// Run the preservation hook for a mutation of `path`.
    fn preserve_parent(&mut self, pass: &mut Pass, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) => pass.preserved.open(&mut *self.fs, parent),
            None => Ok(()),
        }
    }

    /// Remove a node of the wrong kind so the entry can be created in its
    /// place.
    fn replace(&mut self, pass: &mut Pass, path: &Path, existing: &Metadata) -> Result<()> {
        tracing::debug!("replacing {:?} at {}", existing.kind, path.display());
        self.preserve_parent(pass, path)?;
        self.fs
            .remove_all(path)
            .map_err(|e| SyncError::disk("remove", path, e))?;
        pass.inventory.remove_descendants(path);
        Ok(())
    }

    fn materialize(
        &mut self,
        pass: &mut Pass,
        entry: &ArchiveEntry,
        existing: Option<&Metadata>,
        content: &mut dyn Read,
    ) -> Result<Materialized> {
        let path = entry.path.as_path();

        match &entry.kind {
            EntryKind::Hardlink(target) => {
                let target_meta = self
                    .fs
                    .lstat(target)
                    .map_err(|e| SyncError::disk("stat", target, e))?
                    .ok_or_else(|| SyncError::LinkTarget {
                        path: path.to_path_buf(),
                        target: target.clone(),
                    })?;
                if let Some(meta) = existing {
                    if meta.ino == target_meta.ino {
                        return Ok(Materialized::LinkIntact);
                    }
                    self.replace(pass, path, meta)?;
                }
                tracing::debug!("linking {} -> {}", path.display(), target.display());
                self.preserve_parent(pass, path)?;
                self.fs
                    .link(target, path)
                    .map_err(|e| SyncError::disk("link", path, e))?;
                Ok(Materialized::Created)
            }

            EntryKind::Regular => {
                match existing {
                    Some(meta) if meta.is_file() => {
                        if meta.size == entry.size && meta.mtime == entry.mtime {
                            tracing::trace!("{} unchanged by size and mtime", path.display());
                            return Ok(Materialized::Kept);
                        }
                        // Unlink first so the content lands on a fresh inode
                        // and other names for the old one keep their data.
                        self.preserve_parent(pass, path)?;
                        self.fs
                            .remove(path)
                            .map_err(|e| SyncError::disk("remove", path, e))?;
                    }
                    Some(meta) => self.replace(pass, path, meta)?,
                    None => {}
                }
                tracing::debug!("writing {} ({} bytes)", path.display(), entry.size);
                self.preserve_parent(pass, path)?;
                let written = self
                    .fs
                    .write_file(path, content)
                    .map_err(|e| SyncError::disk("write", path, e))?;
                if written != entry.size {
                    return Err(SyncError::Archive(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "archive truncated in {}: expected {} bytes, got {written}",
                            path.display(),
                            entry.size
                        ),
                    )));
                }
                pass.stats.bytes_written += written;
                Ok(Materialized::Created)
            }

            EntryKind::Directory => {
                match existing {
                    Some(meta) if meta.is_dir() => return Ok(Materialized::Kept),
                    Some(meta) => self.replace(pass, path, meta)?,
                    None => {}
                }
                tracing::debug!("creating directory {}", path.display());
                self.preserve_parent(pass, path)?;
                self.fs
                    .mkdir(path, entry.mode)
                    .map_err(|e| SyncError::disk("mkdir", path, e))?;
                Ok(Materialized::Created)
            }

            EntryKind::Symlink(target) => {
                match existing {
                    Some(meta) if meta.is_symlink() => {
                        let current = self
                            .fs
                            .readlink(path)
                            .map_err(|e| SyncError::disk("readlink", path, e))?;
                        if current == *target {
                            return Ok(Materialized::Kept);
                        }
                        self.preserve_parent(pass, path)?;
                        self.fs
                            .remove(path)
                            .map_err(|e| SyncError::disk("remove", path, e))?;
                    }
                    Some(meta) => self.replace(pass, path, meta)?,
                    None => {}
                }
                tracing::debug!("symlinking {} -> {}", path.display(), target.display());
                self.preserve_parent(pass, path)?;
                self.fs
                    .symlink(target, path)
                    .map_err(|e| SyncError::disk("symlink", path, e))?;
                Ok(Materialized::Created)
            }
        }
    }

    fn reconcile_metadata(
        &mut self,
        pass: &mut Pass,
        entry: &ArchiveEntry,
        meta: &Metadata,
        update: &mut Update,
    ) -> Result<()> {
        let path = entry.path.as_path();
        let is_symlink = matches!(entry.kind, EntryKind::Symlink(_));

        if meta.uid != entry.uid || meta.gid != entry.gid {
            self.preserve_parent(pass, path)?;
            if is_symlink {
                self.fs
                    .lchown(path, entry.uid, entry.gid)
                    .map_err(|e| SyncError::disk("lchown", path, e))?;
            } else {
                self.fs
                    .chown(path, entry.uid, entry.gid)
                    .map_err(|e| SyncError::disk("chown", path, e))?;
            }
            update.uid = Some(entry.uid);
            update.gid = Some(entry.gid);
        }

        if !is_symlink && meta.mode != entry.mode {
            self.preserve_parent(pass, path)?;
            self.fs
                .chmod(path, entry.mode)
                .map_err(|e| SyncError::disk("chmod", path, e))?;
            update.perm = Some(entry.mode);
        }

        if meta.mtime != entry.mtime {
            self.preserve_parent(pass, path)?;
            self.fs
                .set_times(path, entry.mtime, entry.mtime)
                .map_err(|e| SyncError::disk("chtimes", path, e))?;
            pass.preserved.retime(path, entry.mtime);
            update.mtime = Some(entry.mtime);
        }

        Ok(())
    }

    fn delete_remaining(&mut self, pass: &mut Pass) -> Result<()> {
        let leftovers = std::mem::take(&mut pass.inventory).into_byte_order();
        // Byte order puts siblings like `/a-b` between `/a` and `/a/x`.
        let mut removed: HashSet<PathBuf> = HashSet::new();

        for path in leftovers {
            if path.parent().is_none() {
                continue;
            }
            if path.ancestors().skip(1).any(|a| removed.contains(a)) {
                continue;
            }

            let meta = self
                .fs
                .lstat(&path)
                .map_err(|e| SyncError::disk("lstat", &path, e))?;
            if meta.is_none() {
                tracing::warn!("skipping unreadable path {}", path.display());
                pass.stats.skipped_unreadable += 1;
                continue;
            }

            tracing::debug!("deleting {}", path.display());
            self.preserve_parent(pass, &path)?;
            self.fs
                .remove_all(&path)
                .map_err(|e| SyncError::disk("remove", &path, e))?;
            pass.stats.deleted += 1;
            self.emit(PathUpdate {
                path: path.clone(),
                update: Update::deleted(),
            });
            removed.insert(path);
        }
        Ok(())
    }

    fn emit(&mut self, record: PathUpdate) {
        if record.update.is_empty() {
            return;
        }
        for observer in &mut self.observers {
            observer.notify(&record);
        }
    }
}
