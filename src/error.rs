//! # Error Types
//!
//! One error type for the whole engine. Every failure carries a kind so
//! callers can match without string inspection, and a store that has
//! panicked keeps the original cause alive behind `Closed`.
//!
//! The kinds map onto failure domains:
//!
//! - `Corrupt`: header/footer mismatch, bad checksum, impossible chunk
//!   fields, missing required meta keys
//! - `UnsupportedFormat`: format newer than this build can read/write, or
//!   a foreign block size
//! - `ChunkNotFound`: a page position names a chunk that no longer exists
//! - `Closed`: any operation on a closed (or panicked) store; carries the
//!   panic cause when there was one
//! - `WritingFailed`: write on a read-only store, or the device refused
//! - `Internal`: invariant violation, always routed through the panic path
//! - `Argument`: caller error (duplicate map name, unknown version, ...)
//!
//! Transient read failures while probing headers and footers during
//! recovery are swallowed by the callers (a torn tail is expected after a
//! crash); everything on the write path is fatal.

use std::sync::Arc;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// The failure domain of a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Corrupt,
    UnsupportedFormat,
    ChunkNotFound,
    Closed,
    WritingFailed,
    Internal,
    Argument,
    Io,
}

/// Unified error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("chunk {0} not found")]
    ChunkNotFound(u32),

    #[error("store is closed")]
    Closed(Option<Arc<StoreError>>),

    #[error("write failed: {0}")]
    WritingFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Corrupt(_) => ErrorKind::Corrupt,
            StoreError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            StoreError::ChunkNotFound(_) => ErrorKind::ChunkNotFound,
            StoreError::Closed(_) => ErrorKind::Closed,
            StoreError::WritingFailed(_) => ErrorKind::WritingFailed,
            StoreError::Internal(_) => ErrorKind::Internal,
            StoreError::Argument(_) => ErrorKind::Argument,
            StoreError::Io(_) => ErrorKind::Io,
        }
    }

    /// The panic cause a closed store is carrying, if any.
    pub fn cause(&self) -> Option<&StoreError> {
        match self {
            StoreError::Closed(cause) => cause.as_deref(),
            _ => None,
        }
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        StoreError::UnsupportedFormat(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        StoreError::Internal(msg.into())
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        StoreError::Argument(msg.into())
    }

    pub fn writing_failed(msg: impl Into<String>) -> Self {
        StoreError::WritingFailed(msg.into())
    }

    /// Structural copy for retention as a panic cause. `io::Error` is
    /// not `Clone`, so IO failures are duplicated by kind and message.
    pub(crate) fn duplicate(&self) -> StoreError {
        match self {
            StoreError::Corrupt(m) => StoreError::Corrupt(m.clone()),
            StoreError::UnsupportedFormat(m) => StoreError::UnsupportedFormat(m.clone()),
            StoreError::ChunkNotFound(id) => StoreError::ChunkNotFound(*id),
            StoreError::Closed(cause) => StoreError::Closed(cause.clone()),
            StoreError::WritingFailed(m) => StoreError::WritingFailed(m.clone()),
            StoreError::Internal(m) => StoreError::Internal(m.clone()),
            StoreError::Argument(m) => StoreError::Argument(m.clone()),
            StoreError::Io(e) => {
                StoreError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(StoreError::corrupt("x").kind(), ErrorKind::Corrupt);
        assert_eq!(StoreError::ChunkNotFound(7).kind(), ErrorKind::ChunkNotFound);
        assert_eq!(StoreError::Closed(None).kind(), ErrorKind::Closed);
        assert_eq!(StoreError::argument("x").kind(), ErrorKind::Argument);
    }

    #[test]
    fn closed_carries_the_panic_cause() {
        let cause = Arc::new(StoreError::internal("page write exploded"));
        let err = StoreError::Closed(Some(cause));

        let inner = err.cause().expect("cause SHOULD be retained");
        assert_eq!(inner.kind(), ErrorKind::Internal);
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err: StoreError = io.into();

        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
