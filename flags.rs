//! Per-file encryption flag.
//!
//! A backing file is plaintext only when its `user.encrypted` attribute holds
//! the sentinel `"0"`. Absent, unreadable or any other value means encrypted.

use crate::error::Result;
use crate::xattr;
use dashmap::DashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ENCRYPTION_ATTR: &str = "user.encrypted";

const PLAINTEXT_SENTINEL: &[u8] = b"0";
const ENCRYPTED_VALUE: &[u8] = b"1";

pub trait FlagStore: Send + Sync + 'static {
    fn is_encrypted(&self, backing_path: &Path) -> bool;

    fn set_encrypted(&self, backing_path: &Path, encrypted: bool) -> Result<()>;

    /// Follows a rename of `from` (and anything below it) to `to`.
    /// Stores that keep flags on the file itself need nothing here.
    fn rename_flag(&self, _from: &Path, _to: &Path) {}

    /// Gives the new hard link `to` the flag of `from`
    fn link_flag(&self, _from: &Path, _to: &Path) {}

    /// Forgets the flag of an unlinked name
    fn remove_flag(&self, _backing_path: &Path) {}
}

/// Interprets a raw attribute value
pub fn value_means_encrypted(value: &[u8]) -> bool {
    let value = value.strip_suffix(&[0]).unwrap_or(value);
    value != PLAINTEXT_SENTINEL
}

/// Flags stored as extended attributes on the backing files
#[derive(Debug, Default, Clone, Copy)]
pub struct XattrFlagStore;

impl FlagStore for XattrFlagStore {
    fn is_encrypted(&self, backing_path: &Path) -> bool {
        match xattr::get(backing_path, OsStr::new(ENCRYPTION_ATTR)) {
            Ok(Some(value)) => value_means_encrypted(&value),
            Ok(None) => true,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %backing_path.display(), error = %e, "unreadable encryption flag, assuming encrypted");
                }
                true
            }
        }
    }

    fn set_encrypted(&self, backing_path: &Path, encrypted: bool) -> Result<()> {
        let value = if encrypted {
            ENCRYPTED_VALUE
        } else {
            PLAINTEXT_SENTINEL
        };
        debug!(path = %backing_path.display(), encrypted, "setting encryption flag");
        xattr::set(backing_path, OsStr::new(ENCRYPTION_ATTR), value, 0)?;
        Ok(())
    }
}

/// Flags kept in process memory, for backing filesystems without user xattrs
#[derive(Debug, Default)]
pub struct MemoryFlagStore {
    flags: DashMap<PathBuf, bool>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlagStore for MemoryFlagStore {
    fn is_encrypted(&self, backing_path: &Path) -> bool {
        self.flags.get(backing_path).map(|f| *f).unwrap_or(true)
    }

    fn set_encrypted(&self, backing_path: &Path, encrypted: bool) -> Result<()> {
        self.flags.insert(backing_path.to_path_buf(), encrypted);
        Ok(())
    }

    fn rename_flag(&self, from: &Path, to: &Path) {
        if from == to {
            return;
        }
        // Whatever the target held is gone
        self.flags.retain(|path, _| !path.starts_with(to));
        let moved: Vec<(PathBuf, bool)> = self
            .flags
            .iter()
            .filter(|entry| entry.key().starts_with(from))
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        for (old, encrypted) in moved {
            let Ok(rest) = old.strip_prefix(from) else {
                continue;
            };
            let new = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            self.flags.remove(&old);
            self.flags.insert(new, encrypted);
        }
        debug!(from = %from.display(), to = %to.display(), "moved in-memory flags");
    }

    fn link_flag(&self, from: &Path, to: &Path) {
        match self.flags.get(from).map(|f| *f) {
            Some(encrypted) => {
                self.flags.insert(to.to_path_buf(), encrypted);
            }
            None => {
                self.flags.remove(to);
            }
        }
    }

    fn remove_flag(&self, backing_path: &Path) {
        self.flags.remove(backing_path);
    }
}

impl<F: FlagStore> FlagStore for std::sync::Arc<F> {
    fn is_encrypted(&self, backing_path: &Path) -> bool {
        (**self).is_encrypted(backing_path)
    }

    fn set_encrypted(&self, backing_path: &Path, encrypted: bool) -> Result<()> {
        (**self).set_encrypted(backing_path, encrypted)
    }

    fn rename_flag(&self, from: &Path, to: &Path) {
        (**self).rename_flag(from, to)
    }

    fn link_flag(&self, from: &Path, to: &Path) {
        (**self).link_flag(from, to)
    }

    fn remove_flag(&self, backing_path: &Path) {
        (**self).remove_flag(backing_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_sentinel_means_plaintext() {
        assert!(!value_means_encrypted(b"0"));
        assert!(!value_means_encrypted(b"0\0"));
        assert!(value_means_encrypted(b"1"));
        assert!(value_means_encrypted(b""));
        assert!(value_means_encrypted(b"00"));
        assert!(value_means_encrypted(b"false"));
    }

    #[test]
    fn xattr_store_defaults_to_encrypted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"").unwrap();

        let store = XattrFlagStore;
        assert!(store.is_encrypted(&file));
        assert!(store.is_encrypted(&tmp.path().join("missing")));
    }

    #[test]
    fn xattr_store_round_trips_when_supported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"").unwrap();

        let store = XattrFlagStore;
        match store.set_encrypted(&file, false) {
            Ok(()) => {}
            // Host filesystem has no user xattrs
            Err(crate::SealFsError::Io(e)) if xattr::is_unsupported(&e) => return,
            Err(crate::SealFsError::PermissionDenied(_)) => return,
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(!store.is_encrypted(&file));

        store.set_encrypted(&file, true).unwrap();
        assert!(store.is_encrypted(&file));
    }

    #[test]
    fn memory_store_defaults_to_encrypted() {
        let store = MemoryFlagStore::new();
        let p = Path::new("/b/file");
        assert!(store.is_encrypted(p));
        store.set_encrypted(p, false).unwrap();
        assert!(!store.is_encrypted(p));
        assert!(store.is_encrypted(Path::new("/b/other")));
    }

    #[test]
    fn memory_store_follows_renames() {
        let store = MemoryFlagStore::new();
        store.set_encrypted(Path::new("/b/a"), false).unwrap();
        store.set_encrypted(Path::new("/b/d/x"), false).unwrap();
        store.set_encrypted(Path::new("/b/target"), true).unwrap();

        store.rename_flag(Path::new("/b/a"), Path::new("/b/target"));
        assert!(!store.is_encrypted(Path::new("/b/target")));
        assert!(store.is_encrypted(Path::new("/b/a")));

        store.rename_flag(Path::new("/b/d"), Path::new("/b/e"));
        assert!(!store.is_encrypted(Path::new("/b/e/x")));
        assert!(store.is_encrypted(Path::new("/b/d/x")));
    }

    #[test]
    fn memory_store_links_and_unlinks() {
        let store = MemoryFlagStore::new();
        store.set_encrypted(Path::new("/b/plain"), false).unwrap();

        store.link_flag(Path::new("/b/plain"), Path::new("/b/alias"));
        assert!(!store.is_encrypted(Path::new("/b/alias")));

        store.remove_flag(Path::new("/b/plain"));
        assert!(store.is_encrypted(Path::new("/b/plain")));
        assert!(!store.is_encrypted(Path::new("/b/alias")));
    }
}
