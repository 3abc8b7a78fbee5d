/*!
Typed failures of the remote blob API.
*/

use crate::error::ErrorKind;
use rekindle_retry::RetryableError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// 401, or a 403 that is not rate limiting
    #[error("remote rejected the credential (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("not found: {0}")]
    NotFound(String),

    /// 429, or a 403 with an exhausted rate limit
    #[error("rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("remote server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("remote request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    /// A status or body the client does not understand
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl RemoteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Unauthorized { .. } => ErrorKind::Auth,
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::RateLimited { .. }
            | RemoteError::ServerError { .. }
            | RemoteError::Timeout
            | RemoteError::Transport(_) => ErrorKind::TransientNetwork,
            RemoteError::UnexpectedResponse(_) => ErrorKind::Other,
        }
    }
}

impl RetryableError for RemoteError {
    fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}
