//! Typed view of tar archive entries.
//!
//! The reconciler never looks at raw tar headers. Each header is converted
//! into an [`ArchiveEntry`]: an absolute, normalized partition path, an
//! [`EntryKind`] tag carrying the link target where one applies, and the
//! metadata that gets reconciled against the disk.
//!
//! # Path normalization
//!
//! Entry names are joined onto `/` and cleaned lexically, the same way for
//! entry paths and hard link targets:
//!
//! ```
//! use imgsync::archive::normalize_path;
//! use std::path::Path;
//!
//! assert_eq!(normalize_path(Path::new("./etc/")), Path::new("/etc"));
//! assert_eq!(normalize_path(Path::new("../../etc/passwd")), Path::new("/etc/passwd"));
//! assert_eq!(normalize_path(Path::new("./")), Path::new("/"));
//! ```

use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tar::EntryType;

use crate::disk::PERM_MASK;
use crate::error::{Result, SyncError};

/// The kind of node an archive entry describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file; content follows the header.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link with its verbatim target.
    Symlink(PathBuf),
    /// Hard link to another path in the archive, normalized to an absolute path.
    Hardlink(PathBuf),
}

impl EntryKind {
    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Regular => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink(_) => "symlink",
            EntryKind::Hardlink(_) => "hardlink",
        }
    }
}

/// One unit of desired state read from the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Absolute normalized path on the partition.
    pub path: PathBuf,
    /// Node kind and link target.
    pub kind: EntryKind,
    /// Content size for regular files.
    pub size: u64,
    /// Permission bits (`mode & 0o7777`).
    pub mode: u32,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Modification time.
    pub mtime: SystemTime,
}

impl ArchiveEntry {
    /// Build an entry from a tar entry.
    ///
    /// Returns `Ok(None)` for pax global headers, which carry no filesystem
    /// node. Device nodes, FIFOs and other exotic types are rejected with
    /// [`SyncError::UnsupportedEntry`].
    pub fn from_tar<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Option<Self>> {
        let entry_type = entry.header().entry_type();
        if entry_type == EntryType::XGlobalHeader {
            return Ok(None);
        }

        let path = normalize_path(&entry.path().map_err(SyncError::Archive)?);
        validate_path(&path)?;

        let link_target = || -> Result<PathBuf> {
            match entry.link_name().map_err(SyncError::Archive)? {
                Some(target) if !target.as_os_str().is_empty() => Ok(target.into_owned()),
                _ => Err(malformed(format!(
                    "{} entry without link target: {}",
                    entry_type_name(entry_type),
                    path.display()
                ))),
            }
        };

        let kind = match entry_type {
            EntryType::Regular | EntryType::Continuous => EntryKind::Regular,
            EntryType::Directory => EntryKind::Directory,
            EntryType::Symlink => EntryKind::Symlink(link_target()?),
            EntryType::Link => EntryKind::Hardlink(normalize_path(&link_target()?)),
            other => {
                return Err(SyncError::UnsupportedEntry {
                    path,
                    kind: entry_type_name(other).to_string(),
                });
            }
        };

        let header = entry.header();
        let mode = header.mode().map_err(SyncError::Archive)? & PERM_MASK;
        let uid = id_field(header.uid().map_err(SyncError::Archive)?, "uid", &path)?;
        let gid = id_field(header.gid().map_err(SyncError::Archive)?, "gid", &path)?;
        let header_mtime = header.mtime().map_err(SyncError::Archive)?;
        let size = match kind {
            EntryKind::Regular => entry.size(),
            _ => 0,
        };
        let mtime = match pax_mtime(entry)? {
            Some(t) => t,
            None => UNIX_EPOCH + Duration::from_secs(header_mtime),
        };

        Ok(Some(ArchiveEntry {
            path,
            kind,
            size,
            mode,
            uid,
            gid,
            mtime,
        }))
    }

    /// Parent directory on the partition; `None` for `/`.
    pub fn parent(&self) -> Option<&Path> {
        self.path.parent()
    }
}

/// Join `name` onto `/` and clean it lexically.
///
/// Empty and `.` components are dropped, `..` removes the previous
/// component but never climbs above the root.
pub fn normalize_path(name: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in name.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Reject paths the partition cannot represent.
fn validate_path(path: &Path) -> Result<()> {
    let path_bytes = path.as_os_str().as_encoded_bytes();

    if path_bytes.len() > libc::PATH_MAX as usize {
        return Err(malformed(format!(
            "path exceeds PATH_MAX ({} bytes): {}",
            libc::PATH_MAX,
            path.display()
        )));
    }

    if path_bytes.contains(&0) {
        return Err(malformed("path contains null byte".to_string()));
    }

    Ok(())
}

fn id_field(value: u64, field: &str, path: &Path) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| malformed(format!("{field} {value} out of range: {}", path.display())))
}

fn malformed(msg: String) -> SyncError {
    SyncError::Archive(io::Error::new(io::ErrorKind::InvalidData, msg))
}

/// Read a sub-second modification time from the entry's pax records.
fn pax_mtime<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Option<SystemTime>> {
    let Some(extensions) = entry.pax_extensions().map_err(SyncError::Archive)? else {
        return Ok(None);
    };
    for ext in extensions {
        let ext = ext.map_err(SyncError::Archive)?;
        if ext.key() == Ok("mtime") {
            let value = ext
                .value()
                .map_err(|e| malformed(format!("pax mtime is not UTF-8: {e}")))?;
            return parse_pax_time(value)
                .map(Some)
                .ok_or_else(|| malformed(format!("invalid pax mtime: {value:?}")));
        }
    }
    Ok(None)
}

/// Parse a pax timestamp such as `1735689600` or `1735689600.250000000`.
///
/// Negative timestamps are clamped to the epoch.
pub(crate) fn parse_pax_time(value: &str) -> Option<SystemTime> {
    let (secs, frac) = match value.split_once('.') {
        Some((s, f)) => (s, f),
        None => (value, ""),
    };
    if secs.starts_with('-') {
        secs.parse::<i64>().ok()?;
        return Some(UNIX_EPOCH);
    }
    let secs: u64 = secs.parse().ok()?;
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut nanos: u32 = 0;
    for (i, digit) in frac.bytes().take(9).enumerate() {
        nanos += u32::from(digit - b'0') * 10u32.pow(8 - i as u32);
    }
    Some(UNIX_EPOCH + Duration::new(secs, nanos))
}

fn entry_type_name(t: EntryType) -> &'static str {
    match t {
        EntryType::Regular | EntryType::Continuous => "file",
        EntryType::Link => "hardlink",
        EntryType::Symlink => "symlink",
        EntryType::Char => "chardev",
        EntryType::Block => "blockdev",
        EntryType::Directory => "directory",
        EntryType::Fifo => "fifo",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries_of(data: &[u8]) -> Result<Vec<ArchiveEntry>> {
        let mut archive = tar::Archive::new(data);
        let mut out = Vec::new();
        for entry in archive.entries().map_err(SyncError::Archive)? {
            let mut entry = entry.map_err(SyncError::Archive)?;
            if let Some(e) = ArchiveEntry::from_tar(&mut entry)? {
                out.push(e);
            }
        }
        Ok(out)
    }

    fn header(entry_type: EntryType, mode: u32, mtime: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(mode);
        header.set_mtime(mtime);
        header.set_uid(1000);
        header.set_gid(100);
        header.set_size(0);
        header
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("")), Path::new("/"));
        assert_eq!(normalize_path(Path::new(".")), Path::new("/"));
        assert_eq!(normalize_path(Path::new("etc/hosts")), Path::new("/etc/hosts"));
        assert_eq!(normalize_path(Path::new("/etc//ssl/./certs/")), Path::new("/etc/ssl/certs"));
        assert_eq!(normalize_path(Path::new("usr/lib/../bin/sh")), Path::new("/usr/bin/sh"));
        assert_eq!(normalize_path(Path::new("../../../../x")), Path::new("/x"));
    }

    #[test]
    fn test_parse_pax_time() {
        let t = |s, n| Some(UNIX_EPOCH + Duration::new(s, n));
        assert_eq!(parse_pax_time("1735689600"), t(1735689600, 0));
        assert_eq!(parse_pax_time("1735689600.25"), t(1735689600, 250_000_000));
        assert_eq!(parse_pax_time("1.0000000015"), t(1, 1));
        assert_eq!(parse_pax_time("-5"), Some(UNIX_EPOCH));
        assert_eq!(parse_pax_time("12a"), None);
        assert_eq!(parse_pax_time("12.x"), None);
    }

    #[test]
    fn test_entry_kinds() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(EntryType::Directory, 0o40755, 1000);
        builder.append_data(&mut h, "./etc/", std::io::empty()).unwrap();

        let mut h = header(EntryType::Regular, 0o100644, 1000);
        h.set_size(3);
        builder.append_data(&mut h, "./etc/hosts", &b"abc"[..]).unwrap();

        let mut h = header(EntryType::Symlink, 0o777, 1000);
        builder.append_link(&mut h, "./etc/localtime", "../usr/share/zoneinfo/UTC").unwrap();

        let mut h = header(EntryType::Link, 0o644, 1000);
        builder.append_link(&mut h, "./etc/hosts.bak", "./etc/hosts").unwrap();

        let data = builder.into_inner().unwrap();
        let entries = entries_of(&data).unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].path, Path::new("/etc"));
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].mode, 0o755);

        assert_eq!(entries[1].kind, EntryKind::Regular);
        assert_eq!(entries[1].size, 3);
        assert_eq!(entries[1].uid, 1000);
        assert_eq!(entries[1].gid, 100);
        assert_eq!(entries[1].mtime, UNIX_EPOCH + Duration::from_secs(1000));

        assert_eq!(
            entries[2].kind,
            EntryKind::Symlink(PathBuf::from("../usr/share/zoneinfo/UTC"))
        );
        assert_eq!(entries[2].size, 0);

        assert_eq!(entries[3].kind, EntryKind::Hardlink(PathBuf::from("/etc/hosts")));
    }

    #[test]
    fn test_unsupported_entry_type() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(EntryType::Fifo, 0o644, 0);
        builder.append_data(&mut h, "run/initctl", std::io::empty()).unwrap();
        let data = builder.into_inner().unwrap();

        match entries_of(&data) {
            Err(SyncError::UnsupportedEntry { path, kind }) => {
                assert_eq!(path, Path::new("/run/initctl"));
                assert_eq!(kind, "fifo");
            }
            other => panic!("expected UnsupportedEntry, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_archive() {
        let mut builder = tar::Builder::new(Vec::new());
        let mut h = header(EntryType::Regular, 0o644, 0);
        h.set_size(1024);
        builder.append_data(&mut h, "big", &[7u8; 1024][..]).unwrap();
        let data = builder.into_inner().unwrap();

        let mut archive = tar::Archive::new(&data[..700]);
        let mut failed = false;
        for entry in archive.entries().unwrap() {
            match entry {
                Ok(mut entry) => {
                    let mut sink = Vec::new();
                    if entry.read_to_end(&mut sink).is_err() {
                        failed = true;
                    }
                }
                Err(_) => failed = true,
            }
        }
        assert!(failed);
    }
}
