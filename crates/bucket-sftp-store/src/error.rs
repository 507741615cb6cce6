//! Store error types.

use std::io;
use thiserror::Error;

/// Object store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object or bucket not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Key is not usable by this backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Key escapes the bucket root (security violation).
    #[error("key escapes bucket root: {0}")]
    KeyEscapesRoot(String),

    /// Writer was used after it was finished.
    #[error("writer already finished: {0}")]
    WriterClosed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists(key.into())
    }

    /// Create an InvalidKey error.
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }

    /// Create a KeyEscapesRoot error.
    pub fn key_escapes_root(key: impl Into<String>) -> Self {
        Self::KeyEscapesRoot(key.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// True when the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound(_) => true,
            StoreError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Store result type.
pub type StoreResult<T> = Result<T, StoreError>;
