//! [`DiskFs`] over a mounted directory.
//!
//! All operations go through a capability handle ([`cap_std::fs::Dir`]) for
//! the partition root, so absolute archive paths such as `/etc/passwd` are
//! resolved inside the mount and never escape it. Metadata queries, ownership
//! and timestamps use rustix `*at` calls relative to the same handle.
//!
//! # Example
//!
//! ```no_run
//! use imgsync::dirfs::DirFs;
//! use imgsync::sync::Reconciler;
//!
//! let mut disk = DirFs::open_mountpoint("/mnt/rootfs")?;
//! let archive = std::fs::File::open("rootfs.tar")?;
//! let stats = Reconciler::new(&mut disk).run(archive)?;
//! println!("{stats}");
//! # Ok::<(), imgsync::SyncError>(())
//! ```

use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, Permissions};
use rustix::fs::{AtFlags, FileType, Gid, Timespec, Timestamps, Uid};
use rustix::io::Errno;

use crate::disk::{DiskFs, FileKind, Metadata, PERM_MASK};
use crate::error::{Result, SyncError};
use crate::inventory::{Inventory, walk_dir};

/// A partition mounted at a host directory.
#[derive(Debug)]
pub struct DirFs {
    root: Dir,
    root_path: PathBuf,
    require_mountpoint: bool,
}

impl DirFs {
    /// Open `path` as the partition root without checking that it is a mount
    /// point. Useful for syncing into plain directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root_path = path.as_ref().to_path_buf();
        let root = Dir::open_ambient_dir(&root_path, ambient_authority())
            .map_err(|e| SyncError::disk("open", &root_path, e))?;
        Ok(DirFs {
            root,
            root_path,
            require_mountpoint: false,
        })
    }

    /// Open `path` as the partition root; [`DiskFs::enumerate_all_paths`]
    /// fails with [`SyncError::NotMounted`] unless a filesystem is mounted
    /// there.
    pub fn open_mountpoint(path: impl AsRef<Path>) -> Result<Self> {
        let mut fs = Self::open(path)?;
        fs.require_mountpoint = true;
        Ok(fs)
    }

    /// Host path of the partition root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Borrow the root directory handle.
    pub fn root_dir(&self) -> &Dir {
        &self.root
    }

    /// Returns true if the root is a mount point: its device differs from its
    /// parent's, or it is its own parent (the host `/`).
    pub fn is_mountpoint(&self) -> Result<bool> {
        let here = rustix::fs::statat(&self.root, ".", AtFlags::empty())
            .map_err(|e| SyncError::disk("stat", &self.root_path, e.into()))?;
        let parent = rustix::fs::statat(&self.root, "..", AtFlags::empty())
            .map_err(|e| SyncError::disk("stat", self.root_path.join(".."), e.into()))?;
        Ok(here.st_dev != parent.st_dev || here.st_ino == parent.st_ino)
    }

    fn query(&self, path: &Path, flags: AtFlags) -> io::Result<Option<Metadata>> {
        match rustix::fs::statat(&self.root, relative(path), flags) {
            Ok(st) => {
                let kind = match FileType::from_raw_mode(st.st_mode as _) {
                    FileType::RegularFile => FileKind::File,
                    FileType::Directory => FileKind::Dir,
                    FileType::Symlink => FileKind::Symlink,
                    _ => FileKind::Other,
                };
                Ok(Some(Metadata {
                    kind,
                    size: st.st_size as u64,
                    mtime: from_timespec(st.st_mtime as i64, st.st_mtime_nsec as i64),
                    mode: st.st_mode as u32 & PERM_MASK,
                    uid: st.st_uid,
                    gid: st.st_gid,
                    ino: st.st_ino as u64,
                }))
            }
            Err(Errno::NOENT) | Err(Errno::NOTDIR) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn chown_with(&self, path: &Path, uid: u32, gid: u32, flags: AtFlags) -> io::Result<()> {
        rustix::fs::chownat(
            &self.root,
            relative(path),
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            flags,
        )?;
        Ok(())
    }
}

/// Map an absolute partition path onto a path relative to the root handle.
fn relative(path: &Path) -> &Path {
    let rel = path.strip_prefix("/").unwrap_or(path);
    if rel.as_os_str().is_empty() {
        Path::new(".")
    } else {
        rel
    }
}

fn from_timespec(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + Duration::from_nanos(nsecs.into())
    }
}

fn to_timespec(t: SystemTime) -> Timespec {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Timespec {
            tv_sec: d.as_secs() as _,
            tv_nsec: d.subsec_nanos() as _,
        },
        Err(e) => {
            let d = e.duration();
            let mut secs = -(d.as_secs() as i64);
            let mut nsecs = d.subsec_nanos();
            if nsecs > 0 {
                secs -= 1;
                nsecs = 1_000_000_000 - nsecs;
            }
            Timespec {
                tv_sec: secs as _,
                tv_nsec: nsecs as _,
            }
        }
    }
}

impl DiskFs for DirFs {
    fn lstat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        self.query(path, AtFlags::SYMLINK_NOFOLLOW)
    }

    fn stat(&self, path: &Path) -> io::Result<Option<Metadata>> {
        self.query(path, AtFlags::empty())
    }

    fn mkdir(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        let rel = relative(path);
        self.root.create_dir(rel)?;
        // The umask applies to create_dir; set the exact bits afterwards.
        let perms = Permissions::from_std(std::fs::Permissions::from_mode(mode & PERM_MASK));
        self.root.set_permissions(rel, perms)
    }

    fn remove(&mut self, path: &Path) -> io::Result<()> {
        let rel = relative(path);
        match self.lstat(path)? {
            Some(meta) if meta.is_dir() => self.root.remove_dir(rel),
            Some(_) => self.root.remove_file(rel),
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn remove_all(&mut self, path: &Path) -> io::Result<()> {
        let rel = relative(path);
        match self.lstat(path)? {
            Some(meta) if meta.is_dir() => self.root.remove_dir_all(rel),
            Some(_) => self.root.remove_file(rel),
            None => Ok(()),
        }
    }

    fn link(&mut self, target: &Path, path: &Path) -> io::Result<()> {
        self.root
            .hard_link(relative(target), &self.root, relative(path))
    }

    fn symlink(&mut self, target: &Path, path: &Path) -> io::Result<()> {
        self.root.symlink_contents(target, relative(path))
    }

    fn readlink(&self, path: &Path) -> io::Result<PathBuf> {
        self.root.read_link_contents(relative(path))
    }

    fn chown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.chown_with(path, uid, gid, AtFlags::empty())
    }

    fn lchown(&mut self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        self.chown_with(path, uid, gid, AtFlags::SYMLINK_NOFOLLOW)
    }

    fn chmod(&mut self, path: &Path, mode: u32) -> io::Result<()> {
        let perms = Permissions::from_std(std::fs::Permissions::from_mode(mode & PERM_MASK));
        self.root.set_permissions(relative(path), perms)
    }

    fn set_times(&mut self, path: &Path, atime: SystemTime, mtime: SystemTime) -> io::Result<()> {
        let times = Timestamps {
            last_access: to_timespec(atime),
            last_modification: to_timespec(mtime),
        };
        rustix::fs::utimensat(&self.root, relative(path), &times, AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(())
    }

    fn write_file(&mut self, path: &Path, content: &mut dyn Read) -> io::Result<u64> {
        let mut file = self.root.create(relative(path))?;
        io::copy(content, &mut file)
    }

    fn enumerate_all_paths(&self) -> Result<Inventory> {
        if self.require_mountpoint && !self.is_mountpoint()? {
            return Err(SyncError::NotMounted(self.root_path.clone()));
        }
        let mut inventory = Inventory::new();
        inventory.insert("/");
        walk_dir(&self.root, Path::new("/"), &mut inventory)
            .map_err(|e| SyncError::disk("walk", &self.root_path, e))?;
        tracing::debug!(
            "inventory of {}: {} paths",
            self.root_path.display(),
            inventory.len()
        );
        Ok(inventory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u64, nanos: u32) -> SystemTime {
        UNIX_EPOCH + Duration::new(secs, nanos)
    }

    #[test]
    fn test_relative() {
        assert_eq!(relative(Path::new("/")), Path::new("."));
        assert_eq!(relative(Path::new("/etc/hosts")), Path::new("etc/hosts"));
        assert_eq!(relative(Path::new("etc")), Path::new("etc"));
    }

    #[test]
    fn test_timespec_conversion() {
        let t = ts(1735689600, 250_000_000);
        let spec = to_timespec(t);
        assert_eq!(spec.tv_sec as i64, 1735689600);
        assert_eq!(spec.tv_nsec as i64, 250_000_000);
        assert_eq!(from_timespec(spec.tv_sec as i64, spec.tv_nsec as i64), t);

        let before = UNIX_EPOCH - Duration::new(1, 500_000_000);
        let spec = to_timespec(before);
        assert_eq!(spec.tv_sec as i64, -2);
        assert_eq!(spec.tv_nsec as i64, 500_000_000);
        assert_eq!(from_timespec(-2, 500_000_000), before);
    }

    #[test]
    fn test_basic_operations() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fs = DirFs::open(tmp.path()).unwrap();

        assert!(fs.lstat(Path::new("/etc")).unwrap().is_none());
        fs.mkdir(Path::new("/etc"), 0o750).unwrap();
        let meta = fs.lstat(Path::new("/etc")).unwrap().unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.mode, 0o750);

        let n = fs
            .write_file(Path::new("/etc/hosts"), &mut &b"127.0.0.1 localhost\n"[..])
            .unwrap();
        assert_eq!(n, 20);
        assert_eq!(
            std::fs::read(tmp.path().join("etc/hosts")).unwrap(),
            b"127.0.0.1 localhost\n"
        );

        fs.link(Path::new("/etc/hosts"), Path::new("/etc/hosts.bak"))
            .unwrap();
        let a = fs.lstat(Path::new("/etc/hosts")).unwrap().unwrap();
        let b = fs.lstat(Path::new("/etc/hosts.bak")).unwrap().unwrap();
        assert_eq!(a.ino, b.ino);

        fs.symlink(Path::new("/etc/hosts"), Path::new("/etc/hosts.link"))
            .unwrap();
        assert_eq!(
            fs.readlink(Path::new("/etc/hosts.link")).unwrap(),
            Path::new("/etc/hosts")
        );
        let l = fs.lstat(Path::new("/etc/hosts.link")).unwrap().unwrap();
        assert!(l.is_symlink());

        let t = ts(1735689600, 123_456_789);
        fs.set_times(Path::new("/etc/hosts.link"), t, t).unwrap();
        let l = fs.lstat(Path::new("/etc/hosts.link")).unwrap().unwrap();
        assert_eq!(l.mtime, t);
        let target = fs.lstat(Path::new("/etc/hosts")).unwrap().unwrap();
        assert_ne!(target.mtime, t);

        fs.remove_all(Path::new("/etc")).unwrap();
        assert!(fs.lstat(Path::new("/etc")).unwrap().is_none());
        fs.remove_all(Path::new("/etc")).unwrap();
    }

    #[test]
    fn test_stat_follows_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fs = DirFs::open(tmp.path()).unwrap();
        fs.write_file(Path::new("/busybox"), &mut &b"\x7fELF"[..])
            .unwrap();
        fs.symlink(Path::new("busybox"), Path::new("/sh")).unwrap();
        fs.symlink(Path::new("missing"), Path::new("/dangling"))
            .unwrap();

        let target = fs.stat(Path::new("/sh")).unwrap().unwrap();
        assert!(target.is_file());
        assert_eq!(target.size, 4);
        assert_eq!(
            target.ino,
            fs.lstat(Path::new("/busybox")).unwrap().unwrap().ino
        );
        assert!(fs.lstat(Path::new("/sh")).unwrap().unwrap().is_symlink());

        assert!(fs.stat(Path::new("/dangling")).unwrap().is_none());
        assert!(fs.lstat(Path::new("/dangling")).unwrap().is_some());
    }

    #[test]
    fn test_chown_to_self() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fs = DirFs::open(tmp.path()).unwrap();
        fs.write_file(Path::new("/f"), &mut &b""[..]).unwrap();
        let uid = rustix::process::getuid().as_raw();
        let gid = rustix::process::getgid().as_raw();
        fs.chown(Path::new("/f"), uid, gid).unwrap();
        let meta = fs.lstat(Path::new("/f")).unwrap().unwrap();
        assert_eq!((meta.uid, meta.gid), (uid, gid));
    }

    #[test]
    fn test_inventory_of_plain_directory() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/hosts"), b"").unwrap();

        let fs = DirFs::open(tmp.path()).unwrap();
        let inv = fs.enumerate_all_paths().unwrap();
        let paths: Vec<_> = inv.iter().collect();
        assert_eq!(
            paths,
            vec![Path::new("/"), Path::new("/etc"), Path::new("/etc/hosts")]
        );

        // A fresh subdirectory of a tempdir is never a mount point.
        std::fs::create_dir(tmp.path().join("mnt")).unwrap();
        let strict = DirFs::open_mountpoint(tmp.path().join("mnt")).unwrap();
        assert!(matches!(
            strict.enumerate_all_paths(),
            Err(SyncError::NotMounted(_))
        ));
    }
}
