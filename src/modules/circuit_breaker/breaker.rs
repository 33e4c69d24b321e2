//! Generation-counted three-state circuit breaker.

use super::config::BreakerConfig;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::info;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Traffic flows normally; failures are counted.
    Closed,
    /// Traffic is refused until the open timeout elapses.
    Open,
    /// A bounded number of probe requests is admitted.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Request statistics for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Requests admitted in this generation.
    pub requests: u32,
    /// Successful requests in this generation.
    pub total_successes: u32,
    /// Failed requests in this generation.
    pub total_failures: u32,
    /// Current consecutive success streak.
    pub consecutive_successes: u32,
    /// Current consecutive failure streak.
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker refused the call (open, or half-open at capacity).
    #[error("circuit breaker is open")]
    Open,

    /// The wrapped action failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Whether this is a breaker rejection rather than an action failure.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Callback invoked on every state transition: `(name, from, to)`.
pub type StateChangeFn = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

/// Predicate deciding whether the breaker should trip after a failure.
pub type TripFn = dyn Fn(&Counts) -> bool + Send + Sync;

struct Inner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A three-state circuit breaker wrapping calls to a single dependency.
///
/// The mutex guards only bookkeeping; the wrapped action always runs
/// outside the lock. Every state transition (and every interval roll of
/// the closed state) advances a generation counter, and a call whose
/// result arrives after its generation has passed is discarded.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    ready_to_trip: Option<Arc<TripFn>>,
    on_state_change: Option<Arc<StateChangeFn>>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker with the default configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, BreakerConfig::default())
    }

    /// Create a breaker with an explicit configuration.
    #[must_use]
    pub fn with_config(name: impl Into<String>, config: BreakerConfig) -> Self {
        let expiry = if config.interval.is_zero() {
            None
        } else {
            Some(Instant::now() + config.interval)
        };

        Self {
            name: name.into(),
            config,
            ready_to_trip: None,
            on_state_change: None,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    /// Replace the trip criteria with a custom predicate.
    #[must_use]
    pub fn with_ready_to_trip(
        mut self,
        f: impl Fn(&Counts) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.ready_to_trip = Some(Arc::new(f));
        self
    }

    /// Register a state-change observer.
    #[must_use]
    pub fn with_on_state_change(
        mut self,
        f: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Get the breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state, advancing timer-driven transitions first.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let transitions = self.advance(&mut inner, Instant::now());
        let state = inner.state;
        drop(inner);
        self.notify(&transitions);
        state
    }

    /// Get the counters of the current generation.
    #[must_use]
    pub fn counts(&self) -> Counts {
        self.inner.lock().expect("breaker lock poisoned").counts
    }

    /// Run `action` through the breaker; success is `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without running the action when the
    /// breaker refuses traffic, or [`BreakerError::Inner`] with the
    /// action's own error.
    pub async fn call<F, T, E>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.call_classified(action, |outcome: &Result<T, E>| outcome.is_ok())
            .await
    }

    /// Run `action` through the breaker with a custom success classifier.
    ///
    /// The classifier sees the action outcome before it is returned; an
    /// `Ok` result may still be recorded as a failure (for instance a
    /// proxied response with a 5xx status).
    ///
    /// A panic or cancellation inside the action is observed as a failure
    /// so the admitted-request count stays consistent.
    ///
    /// # Errors
    ///
    /// See [`CircuitBreaker::call`].
    pub async fn call_classified<F, T, E, C>(
        &self,
        action: F,
        is_success: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        C: FnOnce(&Result<T, E>) -> bool,
    {
        let generation = self.before_request().ok_or(BreakerError::Open)?;

        let guard = CommitGuard {
            breaker: self,
            generation,
            armed: true,
        };

        let outcome = action.await;
        let success = is_success(&outcome);

        guard.disarm();
        self.after_request(generation, success);

        outcome.map_err(BreakerError::Inner)
    }

    /// Admit a request, returning the generation it belongs to.
    fn before_request(&self) -> Option<u64> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let transitions = self.advance(&mut inner, Instant::now());

        let admitted = match inner.state {
            CircuitState::Open => None,
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_requests => None,
            _ => {
                inner.counts.requests += 1;
                Some(inner.generation)
            },
        };

        drop(inner);
        self.notify(&transitions);
        admitted
    }

    /// Commit a request outcome. Outcomes from a stale generation are
    /// discarded: the window they belonged to no longer exists.
    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let mut transitions = self.advance(&mut inner, Instant::now());

        if inner.generation == before {
            if success {
                self.on_success(&mut inner, &mut transitions);
            } else {
                self.on_failure(&mut inner, &mut transitions);
            }
        }

        drop(inner);
        self.notify(&transitions);
    }

    fn on_success(&self, inner: &mut Inner, transitions: &mut Vec<(CircuitState, CircuitState)>) {
        inner.counts.on_success();

        if inner.state == CircuitState::HalfOpen
            && inner.counts.consecutive_successes >= self.config.max_requests
        {
            self.set_state(inner, CircuitState::Closed, transitions);
        }
    }

    fn on_failure(&self, inner: &mut Inner, transitions: &mut Vec<(CircuitState, CircuitState)>) {
        inner.counts.on_failure();

        match inner.state {
            CircuitState::Closed => {
                if self.should_trip(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, transitions);
                }
            },
            CircuitState::HalfOpen => {
                self.set_state(inner, CircuitState::Open, transitions);
            },
            CircuitState::Open => {},
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        match &self.ready_to_trip {
            Some(f) => f(counts),
            None => counts.consecutive_failures >= self.config.trip_threshold,
        }
    }

    /// Advance timer-driven transitions: closed interval rolls and the
    /// open-to-half-open probe window.
    fn advance(&self, inner: &mut Inner, now: Instant) -> Vec<(CircuitState, CircuitState)> {
        let mut transitions = Vec::new();

        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.new_generation(inner, now);
                }
            },
            CircuitState::Open => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, &mut transitions);
                }
            },
            CircuitState::HalfOpen => {},
        }

        transitions
    }

    fn set_state(
        &self,
        inner: &mut Inner,
        state: CircuitState,
        transitions: &mut Vec<(CircuitState, CircuitState)>,
    ) {
        if inner.state == state {
            return;
        }

        let prev = inner.state;
        inner.state = state;
        self.new_generation(inner, Instant::now());
        transitions.push((prev, state));
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            CircuitState::Closed => {
                if self.config.interval.is_zero() {
                    None
                } else {
                    Some(now + self.config.interval)
                }
            },
            CircuitState::Open => Some(now + self.config.timeout),
            CircuitState::HalfOpen => None,
        };
    }

    /// Fire the observer for transitions collected while the lock was held.
    fn notify(&self, transitions: &[(CircuitState, CircuitState)]) {
        for &(from, to) in transitions {
            info!(breaker = %self.name, %from, %to, "Circuit breaker state changed");
            if let Some(observer) = &self.on_state_change {
                observer(&self.name, from, to);
            }
        }
    }
}

/// Records a failure if the call never reaches its commit, which happens
/// when the action panics or the wrapping future is dropped mid-flight.
struct CommitGuard<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl CommitGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.after_request(self.generation, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            max_requests: 2,
            interval: Duration::from_secs(60),
            timeout: Duration::from_millis(50),
            trip_threshold: 5,
        }
    }

    async fn fail(cb: &CircuitBreaker) {
        let _ = cb.call(async { Err::<(), _>("boom") }).await;
    }

    async fn succeed(cb: &CircuitBreaker) {
        let _ = cb.call(async { Ok::<_, &str>(()) }).await;
    }

    #[tokio::test]
    async fn test_starts_closed() {
        let cb = CircuitBreaker::new("test");
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let cb = CircuitBreaker::new("test");
        let result = cb.call(async { Ok::<_, &str>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.counts().total_successes, 1);
    }

    #[tokio::test]
    async fn test_trips_after_threshold_failures() {
        let cb = CircuitBreaker::with_config("test", quick_config());

        for _ in 0..4 {
            fail(&cb).await;
            assert_eq!(cb.state(), CircuitState::Closed);
        }

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_rejects_without_running_action() {
        let cb = CircuitBreaker::with_config("test", quick_config());
        for _ in 0..5 {
            fail(&cb).await;
        }

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = cb
            .call(async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Open)));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes() {
        let cb = CircuitBreaker::with_config("test", quick_config());
        for _ in 0..5 {
            fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // max_requests = 2 successful probes close the breaker
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::with_config("test", quick_config());
        for _ in 0..5 {
            fail(&cb).await;
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_caps_inflight_probes() {
        let cb = Arc::new(CircuitBreaker::with_config("test", quick_config()));
        for _ in 0..5 {
            fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Two probes may be in flight; the third is rejected.
        let (tx, rx1) = tokio::sync::broadcast::channel::<()>(1);
        let rx2 = tx.subscribe();

        let cb1 = Arc::clone(&cb);
        let probe1 = tokio::spawn(async move {
            cb1.call(async move {
                let mut rx = rx1;
                let _ = rx.recv().await;
                Ok::<_, &str>(())
            })
            .await
        });
        let cb2 = Arc::clone(&cb);
        let probe2 = tokio::spawn(async move {
            cb2.call(async move {
                let mut rx = rx2;
                let _ = rx.recv().await;
                Ok::<_, &str>(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let rejected = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(rejected, Err(BreakerError::Open)));

        tx.send(()).unwrap();
        probe1.await.unwrap().unwrap();
        probe2.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_interval_rolls_counts() {
        let config = BreakerConfig {
            interval: Duration::from_millis(30),
            ..quick_config()
        };
        let cb = CircuitBreaker::with_config("test", config);

        fail(&cb).await;
        assert_eq!(cb.counts().consecutive_failures, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test]
    async fn test_stale_generation_discarded() {
        let config = BreakerConfig {
            interval: Duration::from_millis(30),
            ..quick_config()
        };
        let cb = Arc::new(CircuitBreaker::with_config("test", config));

        // Admit a call, let the interval roll while it is in flight, then
        // verify its success never lands in the new generation.
        let cb2 = Arc::clone(&cb);
        let slow = tokio::spawn(async move {
            cb2.call(async {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, &str>(())
            })
            .await
        });

        slow.await.unwrap().unwrap();
        assert_eq!(cb.counts().total_successes, 0);
    }

    #[tokio::test]
    async fn test_panic_observed_as_failure() {
        let cb = Arc::new(CircuitBreaker::with_config("test", quick_config()));

        let cb2 = Arc::clone(&cb);
        let handle = tokio::spawn(async move {
            cb2.call(async {
                panic!("upstream exploded");
                #[allow(unreachable_code)]
                Ok::<_, &str>(())
            })
            .await
        });

        assert!(handle.await.is_err());
        assert_eq!(cb.counts().total_failures, 1);
        assert_eq!(cb.counts().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_classified_success_with_custom_predicate() {
        let cb = CircuitBreaker::with_config("test", quick_config());

        // Ok outcome classified as failure (e.g. a 5xx response).
        for _ in 0..5 {
            let _ = cb
                .call_classified(async { Ok::<u16, &str>(500) }, |outcome| {
                    matches!(outcome, Ok(status) if *status < 500)
                })
                .await;
        }

        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_state_change_observer() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);

        let cb = CircuitBreaker::with_config("observed", quick_config())
            .with_on_state_change(move |name, from, to| {
                seen2
                    .lock()
                    .unwrap()
                    .push((name.to_string(), from, to));
            });

        for _ in 0..5 {
            fail(&cb).await;
        }

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            (
                "observed".to_string(),
                CircuitState::Closed,
                CircuitState::Open
            )
        );
    }

    #[tokio::test]
    async fn test_custom_ready_to_trip() {
        let cb = CircuitBreaker::with_config("test", quick_config())
            .with_ready_to_trip(|counts| counts.total_failures >= 2);

        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
        fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
