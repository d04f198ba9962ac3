//! The disk inventory: every path present on the partition before a run.
//!
//! The inventory is a working set. The reconciler removes each path it sees
//! in the archive; whatever is left once the archive is exhausted gets
//! deleted. Iteration is lexicographic by path component, so a directory is
//! always immediately followed by its descendants. The deletion pass instead
//! takes the leftovers in plain byte order ([`Inventory::into_byte_order`]),
//! which keeps the change stream reproducible and matches a string sort.

use std::collections::BTreeSet;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use cap_std::fs::Dir;

/// Set of absolute partition paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    paths: BTreeSet<PathBuf>,
}

impl Inventory {
    /// Create an empty inventory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path. Returns false if it was already present.
    pub fn insert(&mut self, path: impl Into<PathBuf>) -> bool {
        self.paths.insert(path.into())
    }

    /// Remove a path that was matched by an archive entry.
    pub fn remove(&mut self, path: &Path) -> bool {
        self.paths.remove(path)
    }

    /// Drop every pending path strictly beneath `dir`, returning how many
    /// were dropped. Used when a subtree is removed wholesale.
    pub fn remove_descendants(&mut self, dir: &Path) -> usize {
        let doomed: Vec<PathBuf> = self
            .paths
            .range::<Path, _>((Bound::Excluded(dir), Bound::Unbounded))
            .take_while(|p| p.starts_with(dir))
            .cloned()
            .collect();
        for p in &doomed {
            self.paths.remove(p);
        }
        doomed.len()
    }

    /// Returns true if the path is still pending.
    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    /// Number of pending paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Returns true when no paths are pending.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Iterate pending paths in component-wise lexicographic order.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }
}

impl Inventory {
    /// Consume the inventory, returning the paths sorted by their raw bytes.
    ///
    /// Unlike component order, `/a-b` sorts before `/a/x` here. A directory
    /// still precedes everything beneath it.
    pub fn into_byte_order(self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.paths.into_iter().collect();
        paths.sort_by(|a, b| a.as_os_str().as_encoded_bytes().cmp(b.as_os_str().as_encoded_bytes()));
        paths
    }
}

impl IntoIterator for Inventory {
    type Item = PathBuf;
    type IntoIter = std::collections::btree_set::IntoIter<PathBuf>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}

impl FromIterator<PathBuf> for Inventory {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

/// Recursively record every entry under `dir`, which lives at `prefix` on
/// the partition.
///
/// Symlinks are recorded but never followed. Entries that vanish between the
/// directory read and the type query are recorded anyway; the deletion pass
/// skips paths it can no longer stat.
pub(crate) fn walk_dir(dir: &Dir, prefix: &Path, out: &mut Inventory) -> io::Result<()> {
    for entry in dir.entries()? {
        let entry = entry?;
        let name = entry.file_name();
        let path = prefix.join(&name);
        let is_dir = match entry.file_type() {
            Ok(ft) => ft.is_dir(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        out.insert(path.clone());

        if is_dir {
            let sub = entry.open_dir()?;
            walk_dir(&sub, &path, out)?;
        }
    }
    Ok(())
}
