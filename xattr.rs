//! Extended attribute helpers over the `xattr` crate.
//!
//! All calls operate on the link itself, never its target.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::Path;

/// Value of `name`, or `None` if the attribute is absent
pub fn get(path: &Path, name: &OsStr) -> io::Result<Option<Vec<u8>>> {
    ::xattr::get(path, name)
}

/// Sets `name` to `value`. `flags` takes `XATTR_CREATE` or `XATTR_REPLACE`
/// as setxattr(2) does; 0 creates or replaces.
pub fn set(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    if flags & (libc::XATTR_CREATE | libc::XATTR_REPLACE) != 0 {
        let exists = ::xattr::get(path, name)?.is_some();
        if flags & libc::XATTR_CREATE != 0 && exists {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        if flags & libc::XATTR_REPLACE != 0 && !exists {
            return Err(io::Error::from_raw_os_error(libc::ENODATA));
        }
    }
    ::xattr::set(path, name, value)
}

pub fn list(path: &Path) -> io::Result<Vec<OsString>> {
    Ok(::xattr::list(path)?.collect())
}

pub fn remove(path: &Path, name: &OsStr) -> io::Result<()> {
    ::xattr::remove(path, name)
}

/// Copies every attribute of `from` onto `to`. Attributes `to` may not hold
/// (e.g. `security.*` without privilege) are skipped.
pub fn copy_all(from: &Path, to: &Path) -> io::Result<()> {
    let names = match list(from) {
        Ok(names) => names,
        Err(e) if is_unsupported(&e) => return Ok(()),
        Err(e) => return Err(e),
    };

    for name in names {
        let Some(value) = get(from, &name)? else {
            continue;
        };
        match ::xattr::set(to, &name, &value) {
            Ok(()) => {}
            Err(e) if is_unsupported(&e) || e.raw_os_error() == Some(libc::EPERM) => {
                tracing::debug!(attr = ?name, error = %e, "skipping extended attribute");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// True when the filesystem does not support (user) extended attributes
pub fn is_unsupported(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOTSUP))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns false (and the test should return early) on filesystems
    /// without user xattr support
    fn xattrs_supported(path: &Path) -> bool {
        match set(path, OsStr::new("user.sealfs.check"), b"1", 0) {
            Ok(()) => true,
            Err(e) if is_unsupported(&e) || e.raw_os_error() == Some(libc::EPERM) => false,
            Err(e) => panic!("unexpected xattr error: {}", e),
        }
    }

    #[test]
    fn set_get_list_remove() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        if !xattrs_supported(&file) {
            return;
        }

        let name = OsStr::new("user.color");
        assert_eq!(get(&file, name).unwrap(), None);

        set(&file, name, b"blue", 0).unwrap();
        assert_eq!(get(&file, name).unwrap().as_deref(), Some(&b"blue"[..]));
        assert!(list(&file).unwrap().iter().any(|n| n == name));

        remove(&file, name).unwrap();
        assert_eq!(get(&file, name).unwrap(), None);
    }

    #[test]
    fn create_and_replace_flags_are_honoured() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        if !xattrs_supported(&file) {
            return;
        }

        let name = OsStr::new("user.once");
        let err = set(&file, name, b"v", libc::XATTR_REPLACE).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENODATA));

        set(&file, name, b"v", libc::XATTR_CREATE).unwrap();
        let err = set(&file, name, b"w", libc::XATTR_CREATE).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        set(&file, name, b"w", libc::XATTR_REPLACE).unwrap();
        assert_eq!(get(&file, name).unwrap().as_deref(), Some(&b"w"[..]));
    }

    #[test]
    fn copy_all_carries_values() {
        let tmp = tempfile::TempDir::new().unwrap();
        let from = tmp.path().join("from");
        let to = tmp.path().join("to");
        std::fs::write(&from, b"x").unwrap();
        std::fs::write(&to, b"y").unwrap();
        if !xattrs_supported(&from) {
            return;
        }

        set(&from, OsStr::new("user.encrypted"), b"0", 0).unwrap();
        copy_all(&from, &to).unwrap();
        assert_eq!(
            get(&to, OsStr::new("user.encrypted")).unwrap().as_deref(),
            Some(&b"0"[..])
        );
    }

    #[test]
    fn missing_file_is_an_error_not_absent() {
        let err = get(Path::new("/nonexistent/sealfs/file"), OsStr::new("user.x")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
