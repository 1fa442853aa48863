use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = SealFsError> = std::result::Result<T, E>;

/// Errors surfaced by the encrypted I/O path
#[derive(Debug, Error)]
pub enum SealFsError {
    /// Backing or staging path missing when required
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying access check failed
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Composed path reached the platform path limit
    #[error("Path too long: {len} bytes (limit {max})")]
    PathTooLong { len: usize, max: usize },

    /// Cipher invocation failed (bad key, corrupt or truncated ciphertext)
    #[error("Transform error: {0}")]
    Transform(String),

    /// Read/write/open/close on a backing or staging file failed
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Another session holds the per-path lock; retry later
    #[error("Lock contention on {0}")]
    LockContention(String),

    /// A bridged operation ran past its deadline
    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    /// Key derivation or passphrase errors
    #[error("Key error: {0}")]
    Key(String),
}

impl SealFsError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    pub fn lock_contention(msg: impl Into<String>) -> Self {
        Self::LockContention(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    /// Callers should retry rather than fail permanently
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention(_))
    }

    /// Converts this error to a libc error code for FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => libc::ENOENT,
            Self::PermissionDenied(_) => libc::EACCES,
            Self::PathTooLong { .. } => libc::ENAMETOOLONG,
            Self::Transform(_) | Self::Key(_) => libc::EIO,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::LockContention(_) => libc::EAGAIN,
            Self::TimedOut(_) => libc::ETIMEDOUT,
        }
    }
}

impl From<io::Error> for SealFsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Io(err),
        }
    }
}
