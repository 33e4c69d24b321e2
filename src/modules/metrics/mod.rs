//! # Metrics Module
//!
//! Prometheus metric families for the balancer: request totals by backend
//! and status, active connections per backend, and request duration
//! histograms. The registry is created once at startup and shared.

pub mod registry;

pub use registry::{BackendLabels, LbMetrics, RequestLabels};
