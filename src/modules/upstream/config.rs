//! Upstream TLS client identity configuration.

use serde::{Deserialize, Serialize};

/// mTLS client identity for upstream connections.
///
/// When enabled, every backend transport presents the configured client
/// certificate. The CA bundle verifies the backend's server certificate;
/// `insecure_skip_verify` disables that verification and is meant for
/// testing only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MtlsConfig {
    /// Whether upstream mTLS is enabled.
    pub enabled: bool,

    /// Path to the PEM-encoded client certificate chain.
    pub cert_file: Option<String>,

    /// Path to the PEM-encoded client private key.
    pub key_file: Option<String>,

    /// Path to the PEM-encoded CA bundle for server verification.
    pub ca_file: Option<String>,

    /// Skip server certificate verification.
    pub insecure_skip_verify: bool,
}

impl MtlsConfig {
    /// Validate the configuration shape.
    ///
    /// # Errors
    ///
    /// Returns a message when mTLS is enabled without the required files.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_file.as_deref().unwrap_or("").is_empty()
            || self.key_file.as_deref().unwrap_or("").is_empty()
        {
            return Err("mTLS enabled but cert_file/key_file not provided".to_string());
        }
        if self.ca_file.as_deref().unwrap_or("").is_empty() && !self.insecure_skip_verify {
            return Err(
                "mTLS enabled without ca_file; set ca_file or insecure_skip_verify".to_string(),
            );
        }
        Ok(())
    }
}
