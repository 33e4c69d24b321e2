//! # Autoscale Module
//!
//! Request-rate driven scaling signals. A rolling counter is read and
//! reset on every tick; crossing the threshold (with the cooldown
//! elapsed) publishes a scale event to the supervisor and persists the
//! shared scaling state so peer balancer instances agree on replica
//! counts and cooldowns. The core never starts or stops processes.

pub mod scaler;
pub mod state;

pub use scaler::{AutoScaler, ScaleEvent, ScalingConfig};
pub use state::{ScalingState, ScalingStateManager};
