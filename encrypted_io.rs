//! Offset reads and writes over sealed backing files.
//!
//! This module provides [`EncryptedIo`], the entry points the filesystem
//! driver calls for file content.
//!
//! ## Behaviour
//!
//! - Reads reuse a staged plaintext copy and drop it once a read reaches EOF
//! - Every write restages from the backing file, applies the bytes, reseals
//!   and drops the copy before returning
//! - All sessions on one path are serialized by a per-path lock

use crate::error::Result;
use crate::flags::FlagStore;
use crate::locks::{PathLockGuard, PathLocks};
use crate::paths::PathResolver;
use crate::staging::{remove_if_exists, Stager, StagingGuard};
use crate::streaming::CipherTransform;
use crate::SealFsError;
use std::io::SeekFrom;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error, trace};

pub struct EncryptedIo<T, F> {
    stager: Stager<T, F>,
    locks: PathLocks,
}

impl<T, F> EncryptedIo<T, F>
where
    T: CipherTransform,
    F: FlagStore,
{
    pub fn new(resolver: PathResolver, cipher: T, flags: F) -> Self {
        Self {
            stager: Stager::new(resolver, cipher, flags),
            locks: PathLocks::new(None),
        }
    }

    /// Fail with `LockContention` instead of waiting longer than `timeout`
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.locks = PathLocks::new(timeout);
        self
    }

    pub fn stager(&self) -> &Stager<T, F> {
        &self.stager
    }

    pub fn resolver(&self) -> &PathResolver {
        self.stager.resolver()
    }

    pub fn locks(&self) -> &PathLocks {
        &self.locks
    }

    /// Creates the scratch root and clears anything a previous run left in it
    /// or, as interrupted reseals, beside the backing files
    pub async fn prepare(&self) -> Result<()> {
        self.stager.prepare_scratch().await?;
        self.stager.purge().await?;
        self.stager.sweep_sealing_temps().await?;
        Ok(())
    }

    async fn lock(&self, virtual_path: &Path) -> Result<PathLockGuard> {
        let backing = self.resolver().resolve_backing(virtual_path)?;
        self.locks.acquire(&backing).await
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns 0 at or past EOF.
    pub async fn read(&self, virtual_path: &Path, buf: &mut [u8], offset: u64) -> Result<usize> {
        let _lock = self.lock(virtual_path).await?;
        let session = self.stager.ensure_staged(virtual_path).await?;

        let mut file = fs::File::open(&session.staging).await?;
        let size = file.metadata().await?.len();

        let read_failed = |e: std::io::Error| {
            error!(path = %virtual_path.display(), offset, error = %e, "positioned read failed");
            SealFsError::from(e)
        };

        // On failure the working copy stays for a retried read
        let mut filled = 0;
        if offset < size {
            file.seek(SeekFrom::Start(offset)).await.map_err(read_failed)?;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await.map_err(read_failed)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
        }
        drop(file);

        if offset.saturating_add(filled as u64) >= size {
            remove_if_exists(&session.staging).await?;
            trace!(path = %virtual_path.display(), offset, size, "read reached EOF, staging dropped");
        }

        trace!(path = %virtual_path.display(), offset, requested = buf.len(), read = filled, "read");
        Ok(filled)
    }

    /// Convenience for callers that need an owned buffer
    pub async fn read_to_vec(&self, virtual_path: &Path, len: usize, offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let n = self.read(virtual_path, &mut buf, offset).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes `data` at `offset` and reseals before returning
    pub async fn write(&self, virtual_path: &Path, data: &[u8], offset: u64) -> Result<usize> {
        let _lock = self.lock(virtual_path).await?;
        let session = self.stager.restage(virtual_path).await?;
        let _staging = StagingGuard::new(&session.staging);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&session.staging)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        drop(file);

        self.stager.seal_back(&session).await?;
        debug!(
            path = %virtual_path.display(),
            offset,
            bytes = data.len(),
            encrypted = session.encrypted,
            "write sealed"
        );
        Ok(data.len())
    }

    /// Sets the plaintext length to `size`, zero-filling when growing
    pub async fn truncate(&self, virtual_path: &Path, size: u64) -> Result<()> {
        let _lock = self.lock(virtual_path).await?;
        let session = self.stager.restage(virtual_path).await?;
        let _staging = StagingGuard::new(&session.staging);

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&session.staging)
            .await?;
        file.set_len(size).await?;
        drop(file);

        self.stager.seal_back(&session).await?;
        debug!(path = %virtual_path.display(), size, "truncate sealed");
        Ok(())
    }

    /// Ends any read session on `virtual_path` by removing its working copy
    pub async fn discard(&self, virtual_path: &Path) -> Result<()> {
        let _lock = self.lock(virtual_path).await?;
        if self.stager.discard(virtual_path).await? {
            debug!(path = %virtual_path.display(), "discarded staging file");
        }
        Ok(())
    }

    /// Plaintext size of a regular file, from its backing length alone
    pub async fn plaintext_len(&self, virtual_path: &Path) -> Result<u64> {
        let backing = self.resolver().resolve_backing(virtual_path)?;
        let sealed_len = fs::metadata(&backing).await?.len();
        self.plaintext_len_of(&backing, sealed_len)
    }

    /// Same as [`plaintext_len`](Self::plaintext_len) for callers that
    /// already hold the backing file's metadata
    pub fn plaintext_len_of(&self, backing: &Path, sealed_len: u64) -> Result<u64> {
        if !self.stager.flags().is_encrypted(backing) {
            return Ok(sealed_len);
        }
        self.stager.cipher().plaintext_len(sealed_len).ok_or_else(|| {
            SealFsError::transform(format!(
                "{} has an invalid sealed length {}",
                backing.display(),
                sealed_len
            ))
        })
    }
}
