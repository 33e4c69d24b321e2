//! # Policy Module
//!
//! Traffic routing policies evaluated before normal backend selection.
//! Policies are ordered by descending priority and the first matching
//! rule decides: route to a concrete backend, deny the request, or pass
//! through to the pool's own selection.

pub mod engine;
pub mod error;
pub mod rules;

pub use engine::{PolicyDecision, PolicyRequest, TrafficPolicyEngine};
pub use error::{PolicyError, PolicyResult};
pub use rules::{
    MatchOperator, PolicyConditions, PolicyRule, PolicyType, RuleAction, TrafficPolicy,
};
