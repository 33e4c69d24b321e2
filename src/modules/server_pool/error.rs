//! Server pool error types.

use thiserror::Error;

/// Errors from pool structure operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No backend is alive with a non-open circuit.
    #[error("no selectable backend available")]
    NoSelectableBackend,

    /// The named backend is not in the pool.
    #[error("backend '{0}' not found")]
    BackendNotFound(String),

    /// A backend with this id is already registered.
    #[error("backend '{0}' already registered")]
    DuplicateBackend(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
