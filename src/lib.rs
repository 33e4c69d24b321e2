//! # Helmsman
//!
//! An HTTP reverse-proxy load balancer with adaptive routing, sticky
//! sessions, and per-backend circuit breaking.
//!
//! ## Features
//!
//! - Round-robin, weighted, and latency-aware adaptive backend selection
//! - Region affinity with automatic fallback
//! - Sticky sessions backed by a pluggable external store
//! - Per-backend circuit breakers with generation-counted state
//! - Token-bucket rate limiting with restart warmup
//! - Traffic policies (header, path, geo, canary routing)
//! - Service discovery driven backend sets
//! - Auto-scaling signals from request-rate observation
//! - Prometheus-compatible metrics
//!
//! ## Architecture
//!
//! Each concern lives in its own module under [`modules`]. The
//! [`modules::dispatcher`] glues them together per request: rate check,
//! session/policy/adaptive selection, circuit-breaker-wrapped proxy call,
//! and outcome recording. Background loops (health probing, discovery
//! watching, auto-scale ticking) run as independent tasks with their own
//! shutdown channels.

pub mod config;
pub mod modules;
