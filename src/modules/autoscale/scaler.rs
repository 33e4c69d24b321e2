//! Auto-scaling evaluation loop.

use super::state::ScalingStateManager;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Scaling signal published to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleEvent {
    /// Add capacity; the fleet now targets this replica count.
    Up {
        /// New target replica count.
        replicas: u32,
    },
    /// Remove capacity; the fleet now targets this replica count.
    Down {
        /// New target replica count.
        replicas: u32,
    },
}

/// Auto-scaler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Whether scaling evaluation runs.
    pub enabled: bool,

    /// Seconds between evaluations.
    pub interval_secs: u64,

    /// Requests per window that trigger a scale-up; below half of this
    /// value a scale-down is considered.
    pub threshold: i64,

    /// Cooldown between scaling actions, in seconds.
    pub cooldown_secs: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            threshold: 20,
            cooldown_secs: 120,
        }
    }
}

impl ScalingConfig {
    /// Evaluation interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Periodic scaling evaluator.
///
/// Reads and resets the rolling request counter every interval. The
/// decision and the shared state update happen together so peer
/// instances observe consistent cooldowns; store failures only log.
pub struct AutoScaler {
    counter: Arc<AtomicI64>,
    config: ScalingConfig,
    state: ScalingStateManager,
    events: mpsc::Sender<ScaleEvent>,
    shutdown: mpsc::Receiver<()>,
}

impl std::fmt::Debug for AutoScaler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoScaler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AutoScaler {
    /// Create an auto-scaler over the rolling `counter`.
    #[must_use]
    pub fn new(
        counter: Arc<AtomicI64>,
        config: ScalingConfig,
        state: ScalingStateManager,
        events: mpsc::Sender<ScaleEvent>,
        shutdown: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            counter,
            config,
            state,
            events,
            shutdown,
        }
    }

    /// Run the evaluation loop until shutdown.
    pub async fn run(mut self) {
        if !self.config.enabled {
            debug!("Auto-scaling disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval_secs,
            threshold = self.config.threshold,
            "Starting auto-scale loop"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("Auto-scaler shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.interval()) => {
                    self.tick().await;
                }
            }
        }
    }

    /// Evaluate one window: swap-read the counter and decide.
    pub async fn tick(&self) {
        let count = self.counter.swap(0, Ordering::AcqRel);

        let mut state = match self.state.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Scaling state unavailable, using defaults");
                super::state::ScalingState::default()
            },
        };
        state.cooldown_secs = self.config.cooldown_secs;

        let now = Utc::now();
        let mut event = None;

        if count > self.config.threshold && state.can_scale_up(now) {
            state.replicas += 1;
            state.last_scale_up = Some(now);
            state.accumulated_requests = 0;
            event = Some(ScaleEvent::Up {
                replicas: state.replicas,
            });
            info!(count, replicas = state.replicas, "High load, signaling scale-up");
        } else if count > 0
            && count < self.config.threshold / 2
            && state.replicas > 1
            && state.can_scale_down(now)
        {
            state.replicas -= 1;
            state.last_scale_down = Some(now);
            state.accumulated_requests = 0;
            event = Some(ScaleEvent::Down {
                replicas: state.replicas,
            });
            info!(count, replicas = state.replicas, "Low load, signaling scale-down");
        } else {
            state.accumulated_requests = count;
            debug!(count, "Auto-scale window evaluated, no action");
        }

        if let Err(e) = self.state.save(&state).await {
            warn!(error = %e, "Failed to persist scaling state");
        }

        if let Some(event) = event {
            if self.events.try_send(event).is_err() {
                warn!("Scale event channel full, supervisor is lagging");
            }
        }
    }
}
