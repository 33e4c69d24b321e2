//! Settings assembly from file and environment.

use super::error::{ConfigError, ConfigResult};
use super::types::{default_traffic_policies, Settings};
use std::path::Path;
use tracing::info;

/// Load settings from the process environment, layered over the TOML
/// file named by `LB_CONFIG_FILE` when present.
///
/// # Errors
///
/// Returns a [`ConfigError`] when the file is unreadable, the TOML is
/// malformed, or validation fails. All are fatal at startup.
pub fn from_env() -> ConfigResult<Settings> {
    let mut settings = match std::env::var("LB_CONFIG_FILE") {
        Ok(path) if !path.is_empty() => {
            info!(config_file = %path, "Loading configuration file");
            load_file(&path)?
        },
        _ => Settings::default(),
    };

    apply_env(&mut settings, |name| std::env::var(name).ok());

    if settings.policies.enabled && settings.policies.policies.is_empty() {
        settings.policies.policies = default_traffic_policies();
    }

    settings.validate()?;
    Ok(settings)
}

/// Load settings from a TOML file.
///
/// # Errors
///
/// Returns [`ConfigError::NotFound`], [`ConfigError::Read`], or
/// [`ConfigError::Parse`].
pub fn load_file<P: AsRef<Path>>(path: P) -> ConfigResult<Settings> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(toml::from_str(&content)?)
}

/// Apply recognized environment variables over `settings`.
///
/// `lookup` abstracts the environment so tests can inject values.
pub(crate) fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let truthy = |name: &str| lookup(name).is_some_and(|v| v == "true");

    if let Some(addr) = lookup("LB_LISTEN_ADDR") {
        settings.listen_addr = addr;
    }

    if truthy("REDIS_ENABLED") {
        settings.session.redis_enabled = true;
    }
    if let Some(url) = lookup("REDIS_URL") {
        settings.session.redis_url = Some(url);
    }

    if truthy("TRAFFIC_POLICIES_ENABLED") {
        settings.policies.enabled = true;
    }

    if truthy("CONSUL_ENABLED") {
        settings.discovery.enabled = true;
    }
    if let Some(addr) = lookup("CONSUL_ADDR") {
        settings.discovery.addr = Some(addr);
    }

    if truthy("MTLS_ENABLED") {
        settings.mtls.enabled = true;
    }
    if let Some(path) = lookup("MTLS_CERT_FILE") {
        settings.mtls.cert_file = Some(path);
    }
    if let Some(path) = lookup("MTLS_KEY_FILE") {
        settings.mtls.key_file = Some(path);
    }
    if let Some(path) = lookup("MTLS_CA_FILE") {
        settings.mtls.ca_file = Some(path);
    }
    if truthy("MTLS_INSECURE_SKIP_VERIFY") {
        settings.mtls.insecure_skip_verify = true;
    }
}
