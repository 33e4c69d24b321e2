//! # Circuit Breaker Module
//!
//! Per-backend circuit breaking for fault isolation. A breaker wraps every
//! proxied call to its backend and refuses traffic once the recent failure
//! density crosses a threshold, then probes recovery with a bounded number
//! of trial requests.
//!
//! ## States
//!
//! ```text
//!            readyToTrip                timeout elapsed
//!  Closed ───────────────▶ Open ───────────────────────▶ HalfOpen
//!    ▲                      ▲                                │
//!    │   maxRequests        │          any failure           │
//!    └── successes ─────────┴────────────────────────────────┘
//! ```
//!
//! Counters and the generation number advance together; the outcome of a
//! call that straddles a state transition is discarded so stale results
//! never pollute the current window.

pub mod breaker;
pub mod config;

pub use breaker::{BreakerError, CircuitBreaker, CircuitState, Counts};
pub use config::BreakerConfig;
