//! Upstream transport error types.

use thiserror::Error;

/// Errors from the upstream proxy path.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The call exceeded its deadline.
    #[error("upstream call timed out")]
    Timeout,

    /// TCP connect to the backend failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        /// Backend address.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake with the backend failed.
    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        /// Backend address.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// HTTP exchange with the backend failed.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// A backend URL did not parse.
    #[error("invalid backend URL '{0}'")]
    InvalidUrl(String),

    /// mTLS was enabled but the identity could not be loaded.
    #[error("mTLS configuration error: {0}")]
    TlsConfig(String),
}

impl UpstreamError {
    /// HTTP status the dispatcher surfaces for this failure.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout => 504,
            _ => 502,
        }
    }
}

/// Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;
