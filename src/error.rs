//! Error types for chunked file storage

use std::fmt;
use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Discriminating code carried by every [`StorageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// No file data (zero length or missing metadata)
    NotFound,
    /// Requested range lies outside the recorded length
    Range,
    /// The underlying store rejected an operation
    Backend,
    /// Name is reserved for internal metadata storage
    ReservedName,
    /// Caller supplied an unusable argument
    InvalidArgument,
    /// Task was dropped because its queue was cleared
    QueueCleared,
    /// Task panicked before producing a result
    TaskAborted,
    /// Another live handle owns the file name
    Superseded,
}

impl ErrorCode {
    /// POSIX-flavoured short code, as surfaced by the legacy storage contract
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::Range => "ERANGE",
            ErrorCode::Backend => "EIO",
            ErrorCode::ReservedName => "EACCES",
            ErrorCode::InvalidArgument => "EINVAL",
            ErrorCode::QueueCleared => "ECANCELED",
            ErrorCode::TaskAborted => "EINTR",
            ErrorCode::Superseded => "EBUSY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by storage handles and the registry
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No file: {0}")]
    NotFound(String),

    #[error("Could not satisfy length: {offset}+{size} exceeds file length {length}")]
    Range { offset: u64, size: u64, length: u64 },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Reserved file name: {0}")]
    ReservedName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Task not run: operation queue was cleared")]
    QueueCleared,

    #[error("Task aborted before completion")]
    TaskAborted,

    #[error("Handle for {0} was superseded by a newer live handle")]
    Superseded(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Code identifying the class of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::Range { .. } => ErrorCode::Range,
            StorageError::Backend(_) => ErrorCode::Backend,
            StorageError::ReservedName(_) => ErrorCode::ReservedName,
            StorageError::InvalidArgument(_) | StorageError::Config(_) => {
                ErrorCode::InvalidArgument
            }
            StorageError::QueueCleared => ErrorCode::QueueCleared,
            StorageError::TaskAborted => ErrorCode::TaskAborted,
            StorageError::Superseded(_) => ErrorCode::Superseded,
        }
    }
}

/// Errors raised by chunk and metadata stores
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Connection to {0} is closed")]
    ConnectionClosed(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),

    #[error("Journal checksum mismatch in {0}")]
    CorruptJournal(String),
}
