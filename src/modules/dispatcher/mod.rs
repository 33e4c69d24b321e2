//! # Dispatcher Module
//!
//! The per-request glue and the balancer's HTTP surface. For each
//! request the dispatcher runs the rate check, derives region and
//! session identity, walks the selection chain (existing sticky mapping,
//! policy engine, adaptive assignment, weighted fallback), executes the
//! proxy call through the backend's circuit breaker, and records the
//! outcome into the EWMAs and metric families.

pub mod error;
pub mod handler;
pub mod server;

pub use error::{DispatchError, DispatchResult};
pub use handler::{Dispatcher, SESSION_COOKIE};
pub use server::FrontEnd;
