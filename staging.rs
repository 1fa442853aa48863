//! Plaintext working copies.
//!
//! This module provides [`Stager`], which materializes the plaintext of a
//! backing file into the scratch area and seals a working copy back.
//!
//! ## Sessions
//!
//! - [`Stager::ensure_staged`] reuses an existing working copy
//! - [`Stager::restage`] always starts again from the backing file
//! - [`Stager::seal_back`] replaces the backing file atomically
//!
//! Staging reads the whole backing file up front: the first access to a large
//! file costs a full-file transform and a full-size copy in the scratch area.
//! Callers must hold the per-path lock around every method here.

use crate::error::{Result, SealFsError};
use crate::flags::FlagStore;
use crate::paths::PathResolver;
use crate::streaming::{CipherTransform, Direction};
use crate::xattr;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Suffix of the temporary files a reseal writes next to its backing file
pub const SEALING_SUFFIX: &str = ".sealing";

/// Resolved paths and mode of one staged file
#[derive(Debug, Clone)]
pub struct Session {
    pub backing: PathBuf,
    pub staging: PathBuf,
    pub encrypted: bool,
}

/// Removes a working copy or sealing temporary when dropped unless disarmed
#[derive(Debug)]
pub struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            armed: true,
        }
    }

    /// Leave the file in place
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "staging file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staging file"),
        }
    }
}

pub struct Stager<T, F> {
    resolver: PathResolver,
    cipher: T,
    flags: F,
}

impl<T, F> Stager<T, F>
where
    T: CipherTransform,
    F: FlagStore,
{
    pub fn new(resolver: PathResolver, cipher: T, flags: F) -> Self {
        Self {
            resolver,
            cipher,
            flags,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn cipher(&self) -> &T {
        &self.cipher
    }

    pub fn flags(&self) -> &F {
        &self.flags
    }

    /// Creates the scratch root (mode 0700) if absent
    pub async fn prepare_scratch(&self) -> Result<()> {
        let root = self.resolver.scratch_root();
        fs::create_dir_all(root).await?;
        fs::set_permissions(root, std::fs::Permissions::from_mode(0o700)).await?;
        Ok(())
    }

    /// Removes every working copy left in the scratch root
    pub async fn purge(&self) -> Result<usize> {
        let root = self.resolver.scratch_root();
        let mut removed = 0;
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            removed += 1;
        }
        if removed > 0 {
            info!(root = %root.display(), entries = removed, "purged stale staging files");
        }
        Ok(removed)
    }

    pub fn session(&self, virtual_path: &Path) -> Result<Session> {
        let backing = self.resolver.resolve_backing(virtual_path)?;
        let staging = self.resolver.resolve_staging(virtual_path)?;
        let encrypted = self.flags.is_encrypted(&backing);
        Ok(Session {
            backing,
            staging,
            encrypted,
        })
    }

    /// Makes sure a plaintext working copy exists; a no-op when one does
    pub async fn ensure_staged(&self, virtual_path: &Path) -> Result<Session> {
        let session = self.session(virtual_path)?;
        if fs::try_exists(&session.staging).await? {
            debug!(path = %virtual_path.display(), "reusing staged copy");
            return Ok(session);
        }
        self.materialize(&session).await?;
        Ok(session)
    }

    /// Discards any working copy and materializes a fresh one
    pub async fn restage(&self, virtual_path: &Path) -> Result<Session> {
        let session = self.session(virtual_path)?;
        remove_if_exists(&session.staging).await?;
        self.materialize(&session).await?;
        Ok(session)
    }

    /// Removes the working copy of `virtual_path` if present
    pub async fn discard(&self, virtual_path: &Path) -> Result<bool> {
        let staging = self.resolver.resolve_staging(virtual_path)?;
        remove_if_exists(&staging).await
    }

    async fn materialize(&self, session: &Session) -> Result<()> {
        if let Some(parent) = session.staging.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&session.staging)
            .await?;
        let guard = StagingGuard::new(&session.staging);

        let source = match fs::File::open(&session.backing).await {
            Ok(file) => Some(file),
            // Just created, nothing written yet
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let bytes = match source {
            None => 0,
            Some(file) => {
                let mut reader = BufReader::new(file);
                let mut writer = BufWriter::new(&mut out);
                let bytes = if session.encrypted {
                    self.cipher
                        .transform(Direction::Unseal, &mut reader, &mut writer)
                        .await?
                } else {
                    tokio::io::copy(&mut reader, &mut writer).await?
                };
                writer.flush().await?;
                bytes
            }
        };
        out.flush().await?;

        guard.disarm();
        debug!(
            backing = %session.backing.display(),
            staging = %session.staging.display(),
            encrypted = session.encrypted,
            bytes,
            "materialized staging file"
        );
        Ok(())
    }

    /// Seals the working copy into a temporary file beside the backing file
    /// and renames it into place. The backing file is untouched on failure,
    /// including when the future is dropped partway through.
    pub async fn seal_back(&self, session: &Session) -> Result<u64> {
        let temp = sealing_path(&session.backing)?;
        let guard = StagingGuard::new(&temp);
        let bytes = self.seal_into(session, &temp).await?;
        fs::rename(&temp, &session.backing).await?;
        guard.disarm();
        debug!(backing = %session.backing.display(), bytes, "resealed backing file");
        Ok(bytes)
    }

    /// Removes reseal temporaries an interrupted run left under the backing root
    pub async fn sweep_sealing_temps(&self) -> Result<usize> {
        let mut removed = 0;
        let mut pending = vec![self.resolver.backing_root().to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    pending.push(entry.path());
                } else if kind.is_file()
                    && is_sealing_temp(&entry.file_name())
                    && remove_if_exists(&entry.path()).await?
                {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(root = %self.resolver.backing_root().display(), entries = removed, "removed stale sealing files");
        }
        Ok(removed)
    }

    async fn seal_into(&self, session: &Session, temp: &Path) -> Result<u64> {
        let source = fs::File::open(&session.staging).await?;
        let mut out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(temp)
            .await?;

        let bytes = {
            let mut reader = BufReader::new(source);
            let mut writer = BufWriter::new(&mut out);
            let bytes = if session.encrypted {
                self.cipher
                    .transform(Direction::Seal, &mut reader, &mut writer)
                    .await?
            } else {
                tokio::io::copy(&mut reader, &mut writer).await?
            };
            writer.flush().await?;
            bytes
        };
        out.sync_all().await?;
        drop(out);

        self.carry_metadata(&session.backing, temp).await?;
        Ok(bytes)
    }

    /// Copies mode, ownership and extended attributes (the encryption flag
    /// among them) from the current backing file onto its replacement
    async fn carry_metadata(&self, backing: &Path, temp: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(backing).await {
            Ok(meta) => meta,
            // Nothing to inherit; an unflagged file is encrypted
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        fs::set_permissions(temp, std::fs::Permissions::from_mode(meta.mode() & 0o7777)).await?;

        let (backing, temp) = (backing.to_path_buf(), temp.to_path_buf());
        let (uid, gid) = (meta.uid(), meta.gid());
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            if let Err(e) = std::os::unix::fs::lchown(&temp, Some(uid), Some(gid)) {
                if e.kind() != io::ErrorKind::PermissionDenied {
                    return Err(e);
                }
                debug!(path = %temp.display(), "cannot carry ownership without privilege");
            }
            xattr::copy_all(&backing, &temp)
        })
        .await
        .map_err(|e| SealFsError::Io(io::Error::other(e)))??;
        Ok(())
    }
}

/// `<dir>/.<name>.<uuid>.sealing`
fn sealing_path(backing: &Path) -> Result<PathBuf> {
    let name = backing
        .file_name()
        .ok_or_else(|| SealFsError::not_found(format!("{} has no file name", backing.display())))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(name);
    temp_name.push(format!(".{}{}", Uuid::new_v4().simple(), SEALING_SUFFIX));
    Ok(backing.with_file_name(temp_name))
}

/// True when `name` is a reseal temporary
pub fn is_sealing_temp(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') && name.ends_with(SEALING_SUFFIX)
}

pub(crate) async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
