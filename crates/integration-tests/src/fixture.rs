//! Test fixtures: scratch partitions and archive builders.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use imgsync::DirFs;

/// Modification time stamped on every archive entry (2025-01-01T00:00:00Z).
pub const MTIME: u64 = 1735689600;

/// A scratch directory standing in for a mounted partition.
///
/// The tree lives under `rootfs/` inside a temporary directory, so archives
/// and other scratch files can sit next to it without being inventoried.
/// Everything is removed when the fixture is dropped.
pub struct TestDisk {
    temp_dir: TempDir,
    root_path: PathBuf,
}

impl TestDisk {
    /// Create an empty partition directory.
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let root_path = temp_dir.path().join("rootfs");
        std::fs::create_dir(&root_path)?;
        Ok(Self {
            temp_dir,
            root_path,
        })
    }

    /// Open the partition without requiring a mount point.
    pub fn open(&self) -> color_eyre::Result<DirFs> {
        Ok(DirFs::open(&self.root_path)?)
    }

    /// Path of the partition root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Resolve a partition path like `/etc/hosts` to its host path.
    pub fn host_path(&self, path: &str) -> PathBuf {
        self.root_path.join(path.trim_start_matches('/'))
    }

    /// A path next to the partition, for archives and config files.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

impl std::fmt::Debug for TestDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDisk")
            .field("root_path", &self.root_path)
            .finish()
    }
}

/// Builds tar archives owned by the invoking user.
///
/// Ownership matches the current process so syncs work without
/// privileges: the chown calls become no-ops.
pub struct ArchiveBuilder {
    builder: tar::Builder<Vec<u8>>,
    uid: u64,
    gid: u64,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
            uid: rustix::process::getuid().as_raw().into(),
            gid: rustix::process::getgid().as_raw().into(),
        }
    }

    /// Names are stored verbatim, so `./` and `..` in link targets survive
    /// the way GNU tar writes them.
    fn header(&self, name: &str, kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
        let mut h = tar::Header::new_gnu();
        h.as_old_mut().name[..name.len()].copy_from_slice(name.as_bytes());
        h.set_entry_type(kind);
        h.set_mode(mode);
        h.set_uid(self.uid);
        h.set_gid(self.gid);
        h.set_mtime(MTIME);
        h.set_size(size);
        h.set_cksum();
        h
    }

    fn link_header(&self, name: &str, kind: tar::EntryType, mode: u32, target: &str) -> tar::Header {
        let mut h = self.header(name, kind, mode, 0);
        h.as_old_mut().linkname[..target.len()].copy_from_slice(target.as_bytes());
        h.set_cksum();
        h
    }

    pub fn dir(mut self, name: &str, mode: u32) -> color_eyre::Result<Self> {
        let h = self.header(name, tar::EntryType::Directory, mode, 0);
        self.builder.append(&h, std::io::empty())?;
        Ok(self)
    }

    pub fn file(mut self, name: &str, mode: u32, content: &[u8]) -> color_eyre::Result<Self> {
        let h = self.header(name, tar::EntryType::Regular, mode, content.len() as u64);
        self.builder.append(&h, content)?;
        Ok(self)
    }

    pub fn symlink(mut self, name: &str, target: &str) -> color_eyre::Result<Self> {
        let h = self.link_header(name, tar::EntryType::Symlink, 0o777, target);
        self.builder.append(&h, std::io::empty())?;
        Ok(self)
    }

    pub fn hardlink(mut self, name: &str, target: &str, mode: u32) -> color_eyre::Result<Self> {
        let h = self.link_header(name, tar::EntryType::Link, mode, target);
        self.builder.append(&h, std::io::empty())?;
        Ok(self)
    }

    pub fn finish(self) -> color_eyre::Result<Vec<u8>> {
        Ok(self.builder.into_inner()?)
    }
}

/// A small root filesystem exercising every supported entry type.
pub fn sample_rootfs() -> color_eyre::Result<Vec<u8>> {
    ArchiveBuilder::new()
        .dir("./", 0o755)?
        .dir("./bin/", 0o755)?
        .file("./bin/busybox", 0o755, b"\x7fELF busybox")?
        .hardlink("./bin/sh", "./bin/busybox", 0o755)?
        .dir("./etc/", 0o755)?
        .file("./etc/hostname", 0o644, b"pi\n")?
        .file("./etc/shadow", 0o600, b"root:*:19000:0:99999:7:::\n")?
        .symlink("./etc/localtime", "../usr/share/zoneinfo/UTC")?
        .dir("./usr/", 0o755)?
        .dir("./usr/share/", 0o755)?
        .dir("./usr/share/zoneinfo/", 0o755)?
        .file("./usr/share/zoneinfo/UTC", 0o644, b"TZif2")?
        .finish()
}
