//! Load balancer modules.
//!
//! Every concern of the balancer is a self-contained module:
//!
//! - [`rate_limiting`] - per-client token buckets with restart warmup
//! - [`circuit_breaker`] - per-backend three-state breaker
//! - [`server_pool`] - backend records, selection algorithms, health probing
//! - [`policy`] - priority-ordered traffic routing policies
//! - [`session`] - sticky-session store adapter
//! - [`discovery`] - service catalog adapter feeding the pool
//! - [`autoscale`] - request-rate driven scaling signals
//! - [`upstream`] - proxy transport (plain or mTLS)
//! - [`dispatcher`] - per-request glue and the HTTP surface
//! - [`metrics`] - Prometheus metric families

pub mod autoscale;
pub mod circuit_breaker;
pub mod discovery;
pub mod dispatcher;
pub mod metrics;
pub mod policy;
pub mod rate_limiting;
pub mod server_pool;
pub mod session;
pub mod upstream;
