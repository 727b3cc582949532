//! Error types for memo-core.
//!
//! Every user-observable failure falls into one of a small set of kinds:
//! - validation: malformed pipeline specs, unknown stage parameters
//! - missing resource: a declared executable not found on PATH
//! - integrity: unparseable cache JSON, a file that vanished mid-digest
//! - serialization: JSON encode/decode failures outside the cache
//! - io: filesystem failures
//! - callable: an error raised by wrapped user code, propagated verbatim
//!
//! Integrity errors are recoverable: the hit check downgrades them to a
//! cache miss and the entry is rewritten on the next run.

use thiserror::Error;

/// Result alias used across memo-core.
pub type MemoResult<T> = Result<T, MemoError>;

/// The error type for all memo-core operations.
#[derive(Debug, Error)]
pub enum MemoError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("missing resource: {0}")]
    MissingResource(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("callable error: {0}")]
    Callable(String),
}

impl MemoError {
    pub fn validation(msg: impl Into<String>) -> Self {
        MemoError::Validation(msg.into())
    }

    pub fn missing_resource(msg: impl Into<String>) -> Self {
        MemoError::MissingResource(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        MemoError::Integrity(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        MemoError::Serialization(msg.into())
    }

    pub fn callable(msg: impl Into<String>) -> Self {
        MemoError::Callable(msg.into())
    }
}
