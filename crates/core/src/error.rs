use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Everything the engine can report to a caller.  Variants map 1:1 onto the
/// error kinds surfaced at the public boundary; the CLI turns kinds into
/// process exit codes.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflicting request: {0}")]
    Conflict(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("corrupt record in segment {segment} at offset {offset}: {reason}")]
    CorruptRecord {
        segment: u64,
        offset: u64,
        reason: String,
    },

    #[error("session {0} has no memories")]
    SessionEmpty(String),

    #[error("operation deadline exceeded")]
    Timeout,

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// Stable error classification for exit codes and transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Forbidden,
    Conflict,
    TooLarge,
    CorruptRecord,
    SessionEmpty,
    Timeout,
    Io,
    Internal,
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::TooLarge(_) => ErrorKind::TooLarge,
            Self::CorruptRecord { .. } => ErrorKind::CorruptRecord,
            Self::SessionEmpty(_) => ErrorKind::SessionEmpty,
            Self::Timeout => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Io,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Backoff schedule for transient I/O failures.  Non-I/O errors surface
/// immediately; an `Io` error is retried through the whole schedule before
/// giving up.
const IO_BACKOFF: [Duration; 2] = [Duration::from_millis(50), Duration::from_millis(200)];

pub(crate) fn with_io_retry<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0usize;
    loop {
        match op() {
            Err(MemoryError::Io(err)) if attempt < IO_BACKOFF.len() => {
                warn!(%err, what, attempt, "transient i/o failure, backing off");
                std::thread::sleep(IO_BACKOFF[attempt]);
                attempt += 1;
            }
            other => return other,
        }
    }
}
