/*!
Error types for the Rekindle core.

Every failure maps onto one [`ErrorKind`], which is what callers branch on:
the restorer decides whether to keep retrying, the loops only log.
*/

use crate::storage::RemoteError;
use rekindle_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the Rekindle core.
pub type Result<T> = std::result::Result<T, RekindleError>;

/// Coarse failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, connection failures, 5xx and rate limiting
    TransientNetwork,
    /// The blob id or the requested file does not exist
    NotFound,
    /// A payload could not be encoded or decoded
    Codec,
    /// The remote rejected the credential
    Auth,
    /// Local filesystem or database failure
    LocalIo,
    /// Configuration and programming errors
    Other,
}

/// Errors that can occur while persisting, restoring or coordinating restarts.
#[derive(Error, Debug)]
pub enum RekindleError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local store errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Remote blob API errors
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The blob exists but does not carry the requested file
    #[error("Blob {blob_id} has no file named {file}")]
    MissingFile { blob_id: String, file: String },

    /// Snapshot encode/decode errors
    #[error("Codec error: {0}")]
    Codec(String),

    /// Compression/decompression errors
    #[error("Compression error: {0}")]
    Compression(String),

    /// Integrity check failures
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Invalid snapshot format
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// Local backup directory errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A blocking task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),
}

impl RekindleError {
    /// Create a new codec error
    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec(msg.into())
    }

    /// Create a new compression error
    pub fn compression<S: Into<String>>(msg: S) -> Self {
        Self::Compression(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RekindleError::Io(_) | RekindleError::Database(_) | RekindleError::Storage(_) => {
                ErrorKind::LocalIo
            }
            RekindleError::Json(_)
            | RekindleError::Codec(_)
            | RekindleError::Compression(_)
            | RekindleError::IntegrityCheckFailed { .. }
            | RekindleError::InvalidFormat(_) => ErrorKind::Codec,
            RekindleError::Remote(remote) => remote.kind(),
            RekindleError::MissingFile { .. } => ErrorKind::NotFound,
            RekindleError::Validation(_) | RekindleError::Config(_) | RekindleError::Task(_) => {
                ErrorKind::Other
            }
        }
    }

    /// True when the remote rejected the credential
    pub fn is_auth(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }
}

impl RetryableError for RekindleError {
    fn is_transient(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Auth | ErrorKind::Other)
    }
}

impl From<tokio::task::JoinError> for RekindleError {
    fn from(err: tokio::task::JoinError) -> Self {
        RekindleError::Task(err.to_string())
    }
}
