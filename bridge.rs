//! Runs async core operations from synchronous FUSE callbacks.
//!
//! Each call spawns the future on the runtime and blocks the callback thread
//! on a oneshot until it finishes or the deadline passes. A timed out task is
//! aborted so it cannot keep a path lock.

use crate::error::{Result, SealFsError};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

#[derive(Debug, Default)]
pub struct BridgeStats {
    pub started: AtomicU64,
    pub completed: AtomicU64,
    pub timed_out: AtomicU64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.started.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.timed_out.load(Ordering::Relaxed),
        )
    }
}

/// Blocks on `future` for at most `timeout`.
///
/// Must not be called from a runtime worker thread.
pub fn execute<Fut, T>(
    handle: &Handle,
    timeout: Duration,
    stats: &BridgeStats,
    future: Fut,
) -> Result<T>
where
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    stats.started.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = oneshot::channel();

    let task = handle.spawn(async move {
        let result = tokio::time::timeout(timeout, future).await;
        let _ = tx.send(result);
    });

    match rx.blocking_recv() {
        Ok(Ok(result)) => {
            stats.completed.fetch_add(1, Ordering::Relaxed);
            result
        }
        Ok(Err(_elapsed)) => {
            task.abort();
            stats.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(?timeout, "bridged operation timed out");
            Err(SealFsError::TimedOut(timeout))
        }
        Err(_closed) => {
            task.abort();
            Err(SealFsError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "bridged operation was cancelled",
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_the_future_result() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::default();
        let value = execute(rt.handle(), Duration::from_secs(5), &stats, async { Ok(42) });
        assert_eq!(value.unwrap(), 42);
        assert_eq!(stats.snapshot(), (1, 1, 0));
    }

    #[test]
    fn errors_pass_through() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::default();
        let err = execute::<_, ()>(rt.handle(), Duration::from_secs(5), &stats, async {
            Err(SealFsError::not_found("/x"))
        })
        .unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn deadline_becomes_timed_out() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let stats = BridgeStats::default();
        let err = execute(rt.handle(), Duration::from_millis(10), &stats, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, SealFsError::TimedOut(_)));
        assert_eq!(err.to_errno(), libc::ETIMEDOUT);
        assert_eq!(stats.snapshot(), (1, 0, 1));
    }
}
