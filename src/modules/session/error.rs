//! Session store error types.

use thiserror::Error;

/// Errors from the session store adapter.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The external store could not be reached or refused the operation.
    #[error("session store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored session data did not decode.
    #[error("malformed session data: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;
