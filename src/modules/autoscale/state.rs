//! Shared auto-scaling state persisted in the external store.

use crate::modules::session::{SessionResult, SharedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Scaling state shared across balancer instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingState {
    /// Current replica count known to the fleet.
    pub replicas: u32,
    /// Requests observed in the last window.
    pub accumulated_requests: i64,
    /// Last scale-up instant.
    pub last_scale_up: Option<DateTime<Utc>>,
    /// Last scale-down instant.
    pub last_scale_down: Option<DateTime<Utc>>,
    /// Cooldown between scaling actions, in seconds.
    pub cooldown_secs: u64,
}

impl Default for ScalingState {
    fn default() -> Self {
        Self {
            replicas: 3,
            accumulated_requests: 0,
            last_scale_up: None,
            last_scale_down: None,
            cooldown_secs: 120,
        }
    }
}

impl ScalingState {
    /// Whether a scale-up is allowed by the cooldown.
    #[must_use]
    pub fn can_scale_up(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_elapsed(self.last_scale_up, now)
    }

    /// Whether a scale-down is allowed by the cooldown.
    #[must_use]
    pub fn can_scale_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_elapsed(self.last_scale_down, now)
    }

    fn cooldown_elapsed(&self, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last {
            None => true,
            Some(at) => {
                now.signed_duration_since(at)
                    > chrono::Duration::seconds(i64::try_from(self.cooldown_secs).unwrap_or(0))
            },
        }
    }
}

/// Reads and writes the shared scaling state under
/// `"<prefix>:autoscaling:state"`.
#[derive(Debug)]
pub struct ScalingStateManager {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    state_ttl: Duration,
}

impl ScalingStateManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            state_ttl: ttl,
        }
    }

    /// Load the shared state, defaulting when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the store read fails or the payload does not
    /// decode.
    pub async fn load(&self) -> SessionResult<ScalingState> {
        match self.store.get(&self.state_key()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(ScalingState::default()),
        }
    }

    /// Persist the shared state.
    ///
    /// # Errors
    ///
    /// Returns an error when the store write fails.
    pub async fn save(&self, state: &ScalingState) -> SessionResult<()> {
        let payload = serde_json::to_string(state)?;
        self.store
            .set(&self.state_key(), payload, self.state_ttl)
            .await
    }

    fn state_key(&self) -> String {
        format!("{}:autoscaling:state", self.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::session::MemoryStore;

    #[test]
    fn test_state_roundtrip() {
        let state = ScalingState {
            replicas: 5,
            accumulated_requests: 42,
            last_scale_up: Some(Utc::now()),
            last_scale_down: None,
            cooldown_secs: 120,
        };
        let encoded = serde_json::to_string(&state).unwrap();
        let decoded: ScalingState = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_cooldown_gates() {
        let now = Utc::now();
        let mut state = ScalingState::default();
        assert!(state.can_scale_up(now));

        state.last_scale_up = Some(now);
        assert!(!state.can_scale_up(now));
        assert!(state.can_scale_up(now + chrono::Duration::seconds(121)));
        // Scale-down cooldown is tracked independently.
        assert!(state.can_scale_down(now));
    }

    #[tokio::test]
    async fn test_load_defaults_when_absent() {
        let manager = ScalingStateManager::new(
            Arc::new(MemoryStore::new()),
            "loadbalancer",
            Duration::from_secs(3600),
        );
        let state = manager.load().await.unwrap();
        assert_eq!(state, ScalingState::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let manager = ScalingStateManager::new(
            Arc::clone(&store),
            "loadbalancer",
            Duration::from_secs(3600),
        );

        let mut state = ScalingState::default();
        state.replicas = 7;
        manager.save(&state).await.unwrap();

        assert!(store
            .exists("loadbalancer:autoscaling:state")
            .await
            .unwrap());
        assert_eq!(manager.load().await.unwrap().replicas, 7);
    }
}
