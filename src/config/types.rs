//! Typed settings.

use super::error::{ConfigError, ConfigResult};
use crate::modules::autoscale::ScalingConfig;
use crate::modules::policy::{
    MatchOperator, PolicyConditions, PolicyRule, PolicyType, RuleAction, TrafficPolicy,
};
use crate::modules::rate_limiting::RateLimitConfig;
use crate::modules::server_pool::HealthConfig;
use crate::modules::upstream::{MtlsConfig, Origin};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// One statically configured backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Backend URL, also its id.
    pub url: String,
    /// Relative routing weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Region tag; empty means no affinity.
    #[serde(default)]
    pub region: String,
}

fn default_weight() -> u32 {
    1
}

/// Sticky-session store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Use the external (Redis) session store.
    pub redis_enabled: bool,
    /// Store endpoint.
    pub redis_url: Option<String>,
    /// Key prefix for sessions and shared state.
    pub key_prefix: String,
    /// Session TTL in seconds.
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            redis_enabled: false,
            redis_url: None,
            key_prefix: "loadbalancer".to_string(),
            ttl_secs: 3600,
        }
    }
}

impl SessionSettings {
    /// Session time to live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Service discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Whether discovery drives the backend set.
    pub enabled: bool,
    /// Catalog endpoint.
    pub addr: Option<String>,
    /// Service name to watch.
    pub service: String,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: None,
            service: "web-app".to_string(),
        }
    }
}

/// Traffic policy settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySettings {
    /// Whether the policy engine runs.
    pub enabled: bool,
    /// Installed policies; defaults apply when enabled with none
    /// configured.
    #[serde(default)]
    pub policies: Vec<TrafficPolicy>,
}

/// Complete balancer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Listen address for the front end.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Static backend set (ignored when discovery is enabled).
    #[serde(default = "default_backends")]
    pub backends: Vec<BackendSettings>,

    /// Upstream call deadline in seconds.
    #[serde(default = "default_upstream_deadline")]
    pub upstream_deadline_secs: u64,

    /// Session store settings.
    #[serde(default)]
    pub session: SessionSettings,

    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Health prober settings.
    #[serde(default)]
    pub health: HealthConfig,

    /// Auto-scaler settings.
    #[serde(default)]
    pub scaling: ScalingConfig,

    /// Upstream mTLS identity.
    #[serde(default)]
    pub mtls: MtlsConfig,

    /// Service discovery settings.
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Traffic policy settings.
    #[serde(default)]
    pub policies: PolicySettings,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_upstream_deadline() -> u64 {
    30
}

fn default_backends() -> Vec<BackendSettings> {
    vec![
        BackendSettings {
            url: "http://localhost:8081".to_string(),
            weight: 3,
            region: "us-east".to_string(),
        },
        BackendSettings {
            url: "http://localhost:8082".to_string(),
            weight: 2,
            region: "us-west".to_string(),
        },
        BackendSettings {
            url: "http://localhost:8083".to_string(),
            weight: 1,
            region: "asia".to_string(),
        },
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends: default_backends(),
            upstream_deadline_secs: default_upstream_deadline(),
            session: SessionSettings::default(),
            rate_limit: RateLimitConfig::default(),
            health: HealthConfig::default(),
            scaling: ScalingConfig::default(),
            mtls: MtlsConfig::default(),
            discovery: DiscoverySettings::default(),
            policies: PolicySettings::default(),
        }
    }
}

impl Settings {
    /// Parse the listen address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparseable address.
    pub fn listen_addr(&self) -> ConfigResult<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bad listen address '{}'", self.listen_addr)))
    }

    /// Upstream call deadline.
    #[must_use]
    pub fn upstream_deadline(&self) -> Duration {
        Duration::from_secs(self.upstream_deadline_secs)
    }

    /// Validate the assembled settings. Fatal at startup on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem
    /// found.
    pub fn validate(&self) -> ConfigResult<()> {
        self.listen_addr()?;

        if self.backends.is_empty() && !self.discovery.enabled {
            return Err(ConfigError::Invalid(
                "no backends configured and discovery disabled".to_string(),
            ));
        }

        for backend in &self.backends {
            Origin::parse(&backend.url)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if backend.weight == 0 {
                return Err(ConfigError::Invalid(format!(
                    "backend '{}' has zero weight",
                    backend.url
                )));
            }
        }

        if self.session.redis_enabled
            && self.session.redis_url.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::Invalid(
                "REDIS_ENABLED is set but REDIS_URL is empty".to_string(),
            ));
        }

        self.mtls.validate().map_err(ConfigError::Invalid)?;

        Ok(())
    }
}

/// Demonstration policy set installed when policies are enabled without
/// explicit configuration: geo routing, premium-header redirect, and a
/// 30% canary cohort.
#[must_use]
pub fn default_traffic_policies() -> Vec<TrafficPolicy> {
    vec![
        TrafficPolicy {
            name: "Geo-Based Routing".to_string(),
            policy_type: PolicyType::Geo,
            enabled: true,
            priority: 100,
            weight: 0,
            rules: vec![
                PolicyRule {
                    field: "region".to_string(),
                    operator: MatchOperator::Equals,
                    value: "us-east".to_string(),
                    action: RuleAction::Allow,
                    backend: None,
                    weight: 10,
                },
                PolicyRule {
                    field: "region".to_string(),
                    operator: MatchOperator::Equals,
                    value: "asia".to_string(),
                    action: RuleAction::Redirect,
                    backend: Some("http://localhost:8083".to_string()),
                    weight: 5,
                },
            ],
            conditions: PolicyConditions::default(),
        },
        TrafficPolicy {
            name: "Header-Based API Routing".to_string(),
            policy_type: PolicyType::Header,
            enabled: true,
            priority: 90,
            weight: 0,
            rules: vec![
                PolicyRule {
                    field: "X-API-Version".to_string(),
                    operator: MatchOperator::Equals,
                    value: "v2".to_string(),
                    action: RuleAction::Allow,
                    backend: None,
                    weight: 8,
                },
                PolicyRule {
                    field: "X-Client-Type".to_string(),
                    operator: MatchOperator::Contains,
                    value: "premium".to_string(),
                    action: RuleAction::Redirect,
                    backend: Some("http://localhost:8081".to_string()),
                    weight: 15,
                },
            ],
            conditions: PolicyConditions::default(),
        },
        TrafficPolicy {
            name: "Canary Deployment".to_string(),
            policy_type: PolicyType::Canary,
            enabled: true,
            priority: 80,
            weight: 20,
            rules: Vec::new(),
            conditions: PolicyConditions {
                percentage_traffic: 30,
            },
        },
    ]
}
