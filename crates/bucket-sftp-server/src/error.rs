//! Operation error types and their SFTP status mapping.

use bucket_sftp_store::StoreError;
use thiserror::Error;

use crate::protocol::{OpenFlags, Response, StatusCode};
use crate::reorder::ReadError;

/// Error from a single SFTP operation.
///
/// Every variant becomes a STATUS reply; none of them end the session.
#[derive(Debug, Error)]
pub enum SftpError {
    /// Handle bytes do not name an open record.
    #[error("invalid handle")]
    HandleNotFound,

    /// Handle names a record of the wrong kind (e.g. READ on a directory).
    #[error("handle is not open for {0}")]
    WrongHandleKind(&'static str),

    /// Path does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),

    /// STAT found neither an object nor a prefix.
    #[error("nothing stored at {0}")]
    NothingAt(String),

    /// RMDIR on a prefix with children.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// RMDIR or MKDIR aimed at the bucket root.
    #[error("cannot modify the bucket root")]
    BucketRoot,

    /// MKDIR of an existing directory.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// OPEN with neither READ nor WRITE.
    #[error("unsupported open flags: {0:?}")]
    UnsupportedOpenMode(OpenFlags),

    /// Path bytes are not valid UTF-8.
    #[error("path is not valid UTF-8")]
    InvalidPath,

    /// Operation the bucket model cannot express.
    #[error("operation not supported")]
    Unsupported,

    /// The handle's backend stream failed earlier.
    #[error("stream failed: {0}")]
    StreamFaulted(String),

    /// Pending read abandoned because its handle was closed.
    #[error("read cancelled")]
    ReadCancelled,

    /// Second read at an offset that is already pending.
    #[error("duplicate read at offset {0}")]
    DuplicateRead(u64),

    /// The session ran out of handle numbers.
    #[error("handle space exhausted")]
    HandlesExhausted,

    /// Backend call failed.
    #[error("storage error: {0}")]
    Backend(#[from] StoreError),
}

impl SftpError {
    /// Status code reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            SftpError::NotFound(_) => StatusCode::NoSuchFile,
            SftpError::Unsupported => StatusCode::OpUnsupported,
            _ => StatusCode::Failure,
        }
    }

    /// STATUS reply for request `id`.
    pub fn into_response(self, id: u32) -> Response {
        Response::Status {
            id,
            code: self.status(),
            message: self.to_string(),
        }
    }
}

impl From<ReadError> for SftpError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::StreamFaulted(reason) => SftpError::StreamFaulted(reason),
            ReadError::Cancelled => SftpError::ReadCancelled,
            ReadError::DuplicateOffset(offset) => SftpError::DuplicateRead(offset),
        }
    }
}

/// Operation result type.
pub type SftpResult<T> = Result<T, SftpError>;
