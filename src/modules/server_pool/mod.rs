//! # Server Pool Module
//!
//! The shared pool of proxyable backends and the selection algorithms
//! over it.
//!
//! ## Selection primitives
//!
//! - **Round-robin**: next alive backend from a shared cursor
//! - **Weighted**: stride through an index holding each backend
//!   replicated `weight` times
//! - **Adaptive**: lowest score among a region's backends, where score
//!   combines latency EWMA, success EWMA, weight, in-flight load, and
//!   circuit state
//! - **Sticky**: session-pinned backend resolved through the session
//!   store, re-resolved when the pinned backend stops being selectable
//!
//! A backend is selectable only while it is alive and its circuit
//! breaker is not open. Pool structure is guarded by one reader/writer
//! lock that is never held across a network call.

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod pool;

pub use backend::{Backend, BackendView, ConnectionGuard};
pub use config::HealthConfig;
pub use error::{PoolError, PoolResult};
pub use health::HealthProber;
pub use pool::ServerPool;
