//! Per-path session locks.
//!
//! One async mutex per resolved backing path, created on first use and
//! dropped from the map when its last holder releases. Sessions on different
//! paths never contend.

use crate::error::{Result, SealFsError};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

type LockMap = DashMap<PathBuf, Arc<Mutex<()>>>;

#[derive(Debug, Default, Clone)]
pub struct PathLocks {
    locks: Arc<LockMap>,
    timeout: Option<Duration>,
}

impl PathLocks {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Waits for the lock on `key`; fails with `LockContention` if a timeout
    /// is configured and elapses first
    pub async fn acquire(&self, key: &Path) -> Result<PathLockGuard> {
        let mutex = self.slot(key);
        let guard = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, mutex.lock_owned())
                .await
                .map_err(|_| SealFsError::lock_contention(key.display().to_string()))?,
            None => mutex.lock_owned().await,
        };
        trace!(path = %key.display(), "session lock acquired");
        Ok(self.guard(key, guard))
    }

    /// Fails immediately with `LockContention` if `key` is held
    pub fn try_acquire(&self, key: &Path) -> Result<PathLockGuard> {
        match self.slot(key).try_lock_owned() {
            Ok(guard) => Ok(self.guard(key, guard)),
            Err(_) => Err(SealFsError::lock_contention(key.display().to_string())),
        }
    }

    /// Paths with a held or awaited lock
    pub fn active(&self) -> usize {
        self.locks.len()
    }

    fn slot(&self, key: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_path_buf()).or_default().clone()
    }

    fn guard(&self, key: &Path, guard: OwnedMutexGuard<()>) -> PathLockGuard {
        PathLockGuard {
            guard: Some(guard),
            key: key.to_path_buf(),
            locks: Arc::clone(&self.locks),
        }
    }
}

/// Held for the duration of one session; releases on drop
pub struct PathLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    key: PathBuf,
    locks: Arc<LockMap>,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own handle left: nobody holds or waits on it
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(path = %self.key.display(), "session lock released");
    }
}
