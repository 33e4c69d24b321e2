//! Circuit breaker configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Maximum requests allowed through while half-open.
    pub max_requests: u32,

    /// Cyclic period of the closed state after which counters reset.
    /// Zero disables the periodic reset.
    #[serde(with = "duration_secs")]
    pub interval: Duration,

    /// How long the breaker stays open before probing recovery.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Consecutive failures that trip the breaker from closed to open.
    pub trip_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_requests: 1,
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(60),
            trip_threshold: 5,
        }
    }
}

impl BreakerConfig {
    /// Configuration used for proxied backends.
    #[must_use]
    pub fn for_backend() -> Self {
        Self {
            max_requests: 3,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30),
            trip_threshold: 5,
        }
    }
}

/// Serialize durations as whole seconds in config files.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BreakerConfig::default();
        assert_eq!(config.max_requests, 1);
        assert_eq!(config.trip_threshold, 5);
        assert_eq!(config.interval, Duration::from_secs(60));
    }

    #[test]
    fn test_backend_config() {
        let config = BreakerConfig::for_backend();
        assert_eq!(config.max_requests, 3);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = BreakerConfig::for_backend();
        let encoded = toml::to_string(&config).unwrap();
        let decoded: BreakerConfig = toml::from_str(&encoded).unwrap();
        assert_eq!(decoded.timeout, config.timeout);
        assert_eq!(decoded.trip_threshold, config.trip_threshold);
    }
}
