//! Discovery error types.

use thiserror::Error;

/// Errors from the service catalog.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// The catalog could not be reached.
    #[error("service catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The watch stream ended unexpectedly.
    #[error("catalog watch stream closed")]
    StreamClosed,
}

/// Result type for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
