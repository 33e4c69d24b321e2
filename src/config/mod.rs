//! Balancer configuration.
//!
//! Settings come from environment variables (the operational contract:
//! `REDIS_ENABLED`, `TRAFFIC_POLICIES_ENABLED`, `CONSUL_ENABLED`,
//! `MTLS_*`, ...) layered over an optional TOML file named by
//! `LB_CONFIG_FILE`. Invalid configuration is fatal at startup.

pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::{from_env, load_file};
pub use types::{
    default_traffic_policies, BackendSettings, DiscoverySettings, PolicySettings,
    SessionSettings, Settings,
};
