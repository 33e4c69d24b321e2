//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating configuration. All of
/// these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named configuration file does not exist.
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is structurally valid but semantically wrong.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ConfigError::Invalid("backend weight must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "invalid configuration: backend weight must be positive"
        );
    }
}
