//! In-memory [`DiskFs`] implementation.
//!
//! `MemFs` models just enough of a POSIX filesystem to exercise the
//! reconciler without touching the host: inodes with link counts, directory
//! mtimes that move when children are created or removed, symlinks resolved
//! by [`DiskFs::stat`], and a clock that advances on every mutation so that
//! side effects on timestamps are observable.
//!
//! It also simulates the odd corners of a real partition walk: "phantom"
//! paths that show up in the inventory but cannot be queried, an unmounted
//! state, and per-path fault injection.
//!
//! Intermediate path components are never resolved through symlinks.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::archive::normalize_path;
use crate::disk::{DiskFs, FileKind, Metadata, PERM_MASK};
use crate::error::{Result, SyncError};
use crate::inventory::Inventory;

const ROOT_INO: u64 = 1;
const MAX_SYMLINK_DEPTH: usize = 40;
const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone)]
struct Inode {
    kind: FileKind,
    mode: u32,
    uid: u32,
    gid: u32,
    atime: SystemTime,
    mtime: SystemTime,
    data: Vec<u8>,
    target: PathBuf,
    nlink: u32,
}

impl Inode {
    fn new(kind: FileKind, mode: u32, now: SystemTime) -> Self {
        Inode {
            kind,
            mode: mode & PERM_MASK,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            data: Vec::new(),
            target: PathBuf::new(),
            nlink: 1,
        }
    }

    fn size(&self) -> u64 {
        match self.kind {
            FileKind::File => self.data.len() as u64,
            FileKind::Symlink => self.target.as_os_str().len() as u64,
            FileKind::Dir | FileKind::Other => 0,
        }
    }
}

/// In-memory partition.
#[derive(Debug, Clone)]
pub struct MemFs {
    inodes: BTreeMap<u64, Inode>,
    entries: BTreeMap<PathBuf, u64>,
    next_ino: u64,
    clock: SystemTime,
    writes: u64,
    phantoms: BTreeSet<PathBuf>,
    failing: BTreeSet<PathBuf>,
    mounted: bool,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// Create a partition holding only `/` (mode 0755, owned by root).
    pub fn new() -> Self {
        let clock = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_INO, Inode::new(FileKind::Dir, 0o755, clock));
        let mut entries = BTreeMap::new();
        entries.insert(PathBuf::from("/"), ROOT_INO);
        MemFs {
            inodes,
            entries,
            next_ino: ROOT_INO + 1,
            clock,
            writes: 0,
            phantoms: BTreeSet::new(),
            failing: BTreeSet::new(),
            mounted: true,
        }
    }

    /// Seed a directory, creating missing parents with mode 0755.
    ///
    /// Seeding helpers set exactly the given metadata and do not disturb
    /// parent timestamps.
    pub fn add_dir(&mut self, path: impl AsRef<Path>, mode: u32, mtime: SystemTime) {
        self.seed(path.as_ref(), Inode::new(FileKind::Dir, mode, mtime));
    }

    /// Seed a regular file.
    pub fn add_file(&mut self, path: impl AsRef<Path>, mode: u32, mtime: SystemTime, content: &[u8]) {
        let mut inode = Inode::new(FileKind::File, mode, mtime);
        inode.data = content.to_vec();
        self.seed(path.as_ref(), inode);
    }

    /// Seed a symlink.
    pub fn add_symlink(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>, mtime: SystemTime) {
        let mut inode = Inode::new(FileKind::Symlink, 0o777, mtime);
        inode.target = target.as_ref().to_path_buf();
        self.seed(path.as_ref(), inode);
    }

    /// Seed an additional name for an existing node.
    pub fn add_hardlink(&mut self, path: impl AsRef<Path>, target: impl AsRef<Path>) {
        let path = normalize_path(path.as_ref());
        let Some(&ino) = self.entries.get(&normalize_path(target.as_ref())) else {
            return;
        };
        self.seed_parents(&path);
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink += 1;
        }
        self.entries.insert(path, ino);
    }

    /// Set ownership of a seeded node without following symlinks.
    pub fn set_owner(&mut self, path: impl AsRef<Path>, uid: u32, gid: u32) {
        if let Some(inode) = self.entry_mut(path.as_ref()) {
            inode.uid = uid;
            inode.gid = gid;
        }
    }

    /// Add a path that the inventory reports but that cannot be queried,
    /// like orphan inodes and undecodable names on a real partition.
    pub fn add_phantom(&mut self, path: impl AsRef<Path>) {
        self.phantoms.insert(normalize_path(path.as_ref()));
    }

    /// Detach the partition; the next inventory fails with
    /// [`SyncError::NotMounted`].
    pub fn unmount(&mut self) {
        self.mounted = false;
    }

    /// Make every mutation of `path` fail with `PermissionDenied`.
    pub fn fail_on(&mut self, path: impl AsRef<Path>) {
        self.failing.insert(normalize_path(path.as_ref()));
    }

    /// Contents of the regular file at `path`, without following symlinks.
    pub fn read_file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        let ino = self.entries.get(path.as_ref())?;
        let inode = self.inodes.get(ino)?;
        (inode.kind == FileKind::File).then(|| inode.data.clone())
    }

    /// Every reachable path, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.keys().cloned().collect()
    }

    /// Number of [`DiskFs::write_file`] calls so far.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Link count of the node at `path`.
    pub fn nlink(&self, path: impl AsRef<Path>) -> Option<u32> {
        let ino = self.entries.get(path.as_ref())?;
        self.inodes.get(ino).map(|i| i.nlink)
    }

    fn seed(&mut self, path: &Path, inode: Inode) {
        let path = normalize_path(path);
        self.seed_parents(&path);
        if let Some(old) = self.entries.get(&path).copied() {
            self.inodes.insert(old, inode);
            return;
        }
        let ino = self.alloc(inode);
        self.entries.insert(path, ino);
    }

    fn seed_parents(&mut self, path: &Path) {
        let missing: Vec<PathBuf> = path
            .ancestors()
            .skip(1)
            .filter(|p| !self.entries.contains_key(*p))
            .map(Path::to_path_buf)
            .collect();
        for dir in missing.into_iter().rev() {
            let ino = self.alloc(Inode::new(FileKind::Dir, 0o755, self.clock));
            self.entries.insert(dir, ino);
        }
    }

    fn alloc(&mut self, inode: Inode) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        ino
    }

    fn tick(&mut self) -> SystemTime {
        self.clock += Duration::from_secs(1);
        self.clock
    }

    fn entry_mut(&mut self, path: &Path) -> Option<&mut Inode> {
        let ino = *self.entries.get(path)?;
        self.inodes.get_mut(&ino)
    }

    fn check_fault(&self, path: &Path) -> io::Result<()> {
        if self.failing.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("injected fault: {}", path.display()),
            ));
        }
        Ok(())
    }

    fn describe(&self, ino: u64) -> Option<Metadata> {
        let inode = self.inodes.get(&ino)?;
        Some(Metadata {
            kind: inode.kind,
            size: inode.size(),
            mtime: inode.mtime,
            mode: inode.mode,
            uid: inode.uid,
            gid: inode.gid,
            ino,
        })
    }

    /// Resolve `path` through final-component symlinks.
    fn resolve(&self, path: &Path) -> io::Result<Option<u64>> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_DEPTH {
            let Some(&ino) = self.entries.get(&current) else {
                return Ok(None);
            };
            let Some(inode) = self.inodes.get(&ino) else {
                return Ok(None);
            };
            if inode.kind != FileKind::Symlink {
                return Ok(Some(ino));
            }
            let base = current.parent().unwrap_or(Path::new("/"));
            current = normalize_path(&base.join(&inode.target));
        }
        Err(io::Error::other(format!(
            "too many levels of symbolic links: {}",
            path.display()
        )))
    }

    fn resolve_existing(&self, path: &Path) -> io::Result<u64> {
        self.resolve(path)?.ok_or_else(|| not_found(path))
    }

    /// Validate that `path` can be created: its parent is a directory and
    /// nothing occupies the name.
    fn check_create(&self, path: &Path) -> io::Result<()> {
        self.check_fault(path)?;
        if self.entries.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("file exists: {}", path.display()),
            ));
        }
        let parent = path.parent().ok_or_else(|| not_found(path))?;
        let parent_ino = self.entries.get(parent).ok_or_else(|| not_found(parent))?;
        match self.inodes.get(parent_ino) {
            Some(inode) if inode.kind == FileKind::Dir => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::NotADirectory,
                format!("not a directory: {}", parent.display()),
            )),
        }
    }

    fn touch_parent(&mut self, path: &Path) {
        let now = self.tick();
        if let Some(parent) = path.parent()
            && let Some(inode) = self.entry_mut(parent)
        {
            inode.mtime = now;
        }
    }

    fn create(&mut self, path: &Path, inode: Inode) -> io::Result<u64> {
        self.check_create(path)?;
        let ino = self.alloc(inode);
        self.entries.insert(path.to_path_buf(), ino);
        self.touch_parent(path);
        Ok(ino)
    }

    fn unlink(&mut self, path: &Path) {
        if let Some(ino) = self.entries.remove(path) {
            let drop_inode = match self.inodes.get_mut(&ino) {
                Some(inode) => {
                    inode.nlink = inode.nlink.saturating_sub(1);
                    inode.nlink == 0
                }
                None => false,
            };
            if drop_inode {
                self.inodes.remove(&ino);
            }
            self.touch_parent(path);
        }
    }

    fn has_children(&self, path: &Path) -> bool {
        self.entries
            .keys()
            .any(|p| p.as_path() != path && p.starts_with(path))
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
}

impl DiskFs for MemFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        Ok(self.entries.get(path).and_then(|&ino| self.describe(ino)))
    }

    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        Ok(self.resolve(path)?.and_then(|ino| self.describe(ino)))
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        let now = self.clock;
        self.create(path, Inode::new(FileKind::Dir, mode, now))?;
        Ok(())
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        self.check_fault(path)?;
        if path == Path::new("/") {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "cannot remove /"));
        }
        if !self.entries.contains_key(path) {
            return Err(not_found(path));
        }
        if self.has_children(path) {
            return Err(io::Error::new(
                io::ErrorKind::DirectoryNotEmpty,
                format!("directory not empty: {}", path.display()),
            ));
        }
        self.unlink(path);
        Ok(())
    }

    fn remove_all(&mut self, path: &Path) -> io::Result<()> {
        self.check_fault(path)?;
        if path == Path::new("/") {
            return Err(io::Error::new(io::ErrorKind::ResourceBusy, "cannot remove /"));
        }
        let doomed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in doomed.iter().rev() {
            self.check_fault(p)?;
        }
        for p in doomed.iter().rev() {
            self.unlink(p);
        }
        Ok(())
    }

    fn link(&mut self, target: &Path, path: &Path) -> io::Result<()> {
        let ino = *self.entries.get(target).ok_or_else(|| not_found(target))?;
        if self.inodes.get(&ino).map(|i| i.kind) == Some(FileKind::Dir) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("hard link to directory: {}", target.display()),
            ));
        }
        self.check_create(path)?;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.nlink += 1;
        }
        self.entries.insert(path.to_path_buf(), ino);
        self.touch_parent(path);
        Ok(())
    }

    fn symlink(&mut self, target: &Path, path: &Path) -> io::Result<()> {
        let mut inode = Inode::new(FileKind::Symlink, 0o777, self.clock);
        inode.target = target.to_path_buf();
        self.create(path, inode)?;
        Ok(())
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        let ino = self.entries.get(path).ok_or_else(|| not_found(path))?;
        match self.inodes.get(ino) {
            Some(inode) if inode.kind == FileKind::Symlink => Ok(inode.target.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("not a symlink: {}", path.display()),
            )),
        }
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.check_fault(path)?;
        let ino = self.resolve_existing(path)?;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.uid = uid;
            inode.gid = gid;
        }
        Ok(())
    }

    fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.check_fault(path)?;
        let inode = self.entry_mut(path).ok_or_else(|| not_found(path))?;
        inode.uid = uid;
        inode.gid = gid;
        Ok(())
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        self.check_fault(path)?;
        let ino = self.resolve_existing(path)?;
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.mode = mode & PERM_MASK;
        }
        Ok(())
    }

    fn set_times(&mut self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        self.check_fault(path)?;
        let inode = self.entry_mut(path).ok_or_else(|| not_found(path))?;
        inode.atime = atime;
        inode.mtime = mtime;
        Ok(())
    }

    fn write_file(&mut self, path: &Path, content: &mut dyn Read) -> io::Result<u64> {
        self.check_fault(path)?;
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let len = data.len() as u64;

        match self.resolve(path)? {
            Some(ino) => {
                let now = self.tick();
                let inode = self.inodes.get_mut(&ino).ok_or_else(|| not_found(path))?;
                if inode.kind != FileKind::File {
                    return Err(io::Error::new(
                        io::ErrorKind::IsADirectory,
                        format!("not a regular file: {}", path.display()),
                    ));
                }
                inode.data = data;
                inode.mtime = now;
            }
            None => {
                let now = self.clock;
                let mut inode = Inode::new(FileKind::File, DEFAULT_FILE_MODE, now);
                inode.data = data;
                self.create(path, inode)?;
            }
        }
        self.writes += 1;
        Ok(len)
    }

    fn enumerate_all_paths(&self) -> Result<Inventory> {
        if !self.mounted {
            return Err(SyncError::NotMounted(PathBuf::from("/")));
        }
        Ok(self
            .entries
            .keys()
            .chain(self.phantoms.iter())
            .cloned()
            .collect())
    }
}
