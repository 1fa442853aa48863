//! Virtual path to backing/staging path composition.

use crate::error::{Result, SealFsError};
use std::path::{Component, Path, PathBuf};

/// Maximum composed path length in bytes, including the terminating NUL
pub const PATH_MAX: usize = libc::PATH_MAX as usize;

#[derive(Debug, Clone)]
pub struct PathResolver {
    backing_root: PathBuf,
    scratch_root: PathBuf,
    max_len: usize,
}

impl PathResolver {
    pub fn new(backing_root: impl Into<PathBuf>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            backing_root: backing_root.into(),
            scratch_root: scratch_root.into(),
            max_len: PATH_MAX,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Absolute path of `virtual_path` in the ciphertext store
    pub fn resolve_backing(&self, virtual_path: &Path) -> Result<PathBuf> {
        self.compose(&self.backing_root, virtual_path)
    }

    /// Absolute path of the plaintext working copy of `virtual_path`
    pub fn resolve_staging(&self, virtual_path: &Path) -> Result<PathBuf> {
        self.compose(&self.scratch_root, virtual_path)
    }

    fn compose(&self, root: &Path, virtual_path: &Path) -> Result<PathBuf> {
        let mut out = root.to_path_buf();
        for component in virtual_path.components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(SealFsError::not_found(format!(
                        "{} escapes the mount root",
                        virtual_path.display()
                    )));
                }
            }
        }

        // Room for the NUL terminator the syscalls append
        let len = out.as_os_str().len();
        if len >= self.max_len {
            return Err(SealFsError::PathTooLong {
                len,
                max: self.max_len,
            });
        }
        Ok(out)
    }
}
