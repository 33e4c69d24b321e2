//! Dispatch error taxonomy and its HTTP mapping.

use crate::modules::upstream::UpstreamError;
use thiserror::Error;

/// Why a request could not be proxied.
///
/// Failures are classified at the earliest point their cause is known;
/// everything downstream matches on the variant instead of guessing.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No backend is alive with a non-open circuit.
    #[error("no selectable backend available")]
    NoSelectableBackend,

    /// The chosen backend's circuit breaker refused the call.
    #[error("circuit breaker open for backend '{backend}'")]
    CircuitOpen {
        /// Backend whose breaker is open.
        backend: String,
    },

    /// A traffic policy denied the request.
    #[error("request denied by policy '{policy}'")]
    PolicyDenied {
        /// Name of the denying policy.
        policy: String,
    },

    /// The client exceeded its rate limit.
    #[error("rate limit exceeded for client '{client}'")]
    RateLimited {
        /// Rate-limit key of the client.
        client: String,
    },

    /// The upstream call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl DispatchError {
    /// HTTP status surfaced to the client.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NoSelectableBackend | Self::CircuitOpen { .. } => 503,
            Self::PolicyDenied { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::Upstream(e) => e.status_code(),
        }
    }

    /// Minimal response body for the client.
    #[must_use]
    pub fn body(&self) -> &'static str {
        match self {
            Self::NoSelectableBackend => "Service unavailable",
            Self::CircuitOpen { .. } => {
                "Service temporarily unavailable (circuit breaker open)"
            },
            Self::PolicyDenied { .. } => "Forbidden",
            Self::RateLimited { .. } => "Too Many Requests",
            Self::Upstream(UpstreamError::Timeout) => "Gateway timeout",
            Self::Upstream(_) => "Bad gateway",
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
