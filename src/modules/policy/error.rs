//! Policy engine error types.

use thiserror::Error;

/// Errors raised while installing policies.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A rule's regex pattern failed to compile.
    #[error("invalid regex '{pattern}' in policy '{policy}': {source}")]
    InvalidRegex {
        /// Policy name.
        policy: String,
        /// Offending pattern.
        pattern: String,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;
