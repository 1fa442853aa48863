//! Inode numbers for virtual paths.
//!
//! The kernel addresses files by inode; the core addresses them by virtual
//! path. The table hands out stable numbers per path, counts kernel lookups
//! and follows renames.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    lookups: u64,
}

#[derive(Debug)]
struct Tables {
    by_ino: HashMap<u64, Entry>,
    by_path: HashMap<PathBuf, u64>,
    next_ino: u64,
}

#[derive(Debug)]
pub struct InodeTable {
    inner: RwLock<Tables>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let root = PathBuf::from("/");
        let mut by_ino = HashMap::new();
        by_ino.insert(
            ROOT_INO,
            Entry {
                path: root.clone(),
                lookups: 1,
            },
        );
        let mut by_path = HashMap::new();
        by_path.insert(root, ROOT_INO);
        Self {
            inner: RwLock::new(Tables {
                by_ino,
                by_path,
                next_ino: ROOT_INO + 1,
            }),
        }
    }

    /// Virtual path of `ino`; `None` once its name was replaced by a rename
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inner
            .read()
            .by_ino
            .get(&ino)
            .map(|e| e.path.clone())
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Virtual path of `name` inside directory `parent`
    pub fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        self.path(parent).map(|p| p.join(name))
    }

    /// Returns the inode for `path`, allocating one if needed, and counts
    /// one kernel lookup against it
    pub fn lookup(&self, path: &Path) -> u64 {
        let mut t = self.inner.write();
        if let Some(&ino) = t.by_path.get(path) {
            if let Some(entry) = t.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }
        let ino = t.next_ino;
        t.next_ino += 1;
        t.by_ino.insert(
            ino,
            Entry {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        t.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    /// Inode for `path` without counting a lookup
    pub fn peek(&self, path: &Path) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Drops `nlookup` kernel references; forgets the inode at zero
    pub fn forget(&self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let mut t = self.inner.write();
        let gone = match t.by_ino.get_mut(&ino) {
            Some(entry) => {
                entry.lookups = entry.lookups.saturating_sub(nlookup);
                entry.lookups == 0
            }
            None => false,
        };
        if gone {
            if let Some(entry) = t.by_ino.remove(&ino) {
                if t.by_path.get(&entry.path) == Some(&ino) {
                    t.by_path.remove(&entry.path);
                }
            }
        }
    }

    /// Moves `from` and everything below it to `to`
    pub fn rename(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        let mut t = self.inner.write();
        // A replaced target keeps its inode alive for open handles but loses its name
        if let Some(old) = t.by_path.remove(to) {
            if let Some(entry) = t.by_ino.get_mut(&old) {
                entry.path = PathBuf::new();
            }
        }

        let moved: Vec<(PathBuf, u64)> = t
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, &ino)| (p.clone(), ino))
            .collect();
        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            t.by_path.remove(&old_path);
            t.by_path.insert(new_path.clone(), ino);
            if let Some(entry) = t.by_ino.get_mut(&ino) {
                entry.path = new_path;
            }
        }
    }

    /// Unlinks the name `path`; the inode lives on until forgotten
    pub fn remove_path(&self, path: &Path) {
        self.inner.write().by_path.remove(path);
    }
}
