//! Backend record: identity, health, quality signals, and owned breaker.

use crate::modules::circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
use crate::modules::upstream::{Origin, Transport, UpstreamResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LATENCY_ALPHA: f64 = 0.2;
const SUCCESS_ALPHA: f64 = 0.1;

/// Mutable quality signals, updated after every proxied call.
#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    latency_ewma: f64,
    success_ewma: f64,
}

/// A single proxyable upstream.
///
/// Structure (id, origin, weight, region) is immutable after
/// construction; the liveness flag and connection counter are atomics,
/// and the EWMA pair sits behind a short-lived mutex. The backend owns
/// its circuit breaker and its upstream transport.
#[derive(Debug)]
pub struct Backend {
    id: String,
    origin: Origin,
    weight: u32,
    region: String,
    alive: AtomicBool,
    signals: Mutex<Signals>,
    active: AtomicI64,
    breaker: CircuitBreaker,
    transport: Transport,
}

impl Backend {
    /// Create a backend from its URL with a default breaker and plain
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the URL does not parse.
    pub fn new(
        url: impl Into<String>,
        weight: u32,
        region: impl Into<String>,
    ) -> UpstreamResult<Self> {
        let id = url.into();
        let origin = Origin::parse(&id)?;
        let breaker =
            CircuitBreaker::with_config(format!("backend-{id}"), BreakerConfig::for_backend());

        Ok(Self {
            id,
            origin,
            weight,
            region: region.into(),
            alive: AtomicBool::new(true),
            signals: Mutex::new(Signals::default()),
            active: AtomicI64::new(0),
            breaker,
            transport: Transport::Plain,
        })
    }

    /// Replace the owned circuit breaker.
    #[must_use]
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Replace the upstream transport.
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Stable backend id (its URL).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parsed origin for proxying.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// `host:port` used by the liveness prober.
    #[must_use]
    pub fn probe_addr(&self) -> String {
        self.origin.authority()
    }

    /// Relative share of weighted selection.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Region tag; empty means no affinity.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Whether the prober (or an admin) currently considers this backend
    /// alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Set the liveness flag, returning the previous value.
    pub fn set_alive(&self, alive: bool) -> bool {
        self.alive.swap(alive, Ordering::AcqRel)
    }

    /// Whether this backend may receive traffic: alive with a non-open
    /// circuit.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.is_alive() && self.breaker.state() != CircuitState::Open
    }

    /// Current in-flight proxied calls.
    #[must_use]
    pub fn active_connections(&self) -> i64 {
        self.active.load(Ordering::Acquire)
    }

    /// Track an in-flight call; the guard decrements on every exit path,
    /// including panics.
    #[must_use]
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Fold one call outcome into the latency and success EWMAs.
    ///
    /// Latency is seeded with the first sample; the success signal is
    /// seeded to 1.0 so a cold backend is not penalized.
    pub fn record_metrics(&self, duration: Duration, success: bool) {
        let sample = duration.as_secs_f64();
        let mut signals = self.signals.lock().expect("signals lock poisoned");

        if signals.latency_ewma == 0.0 {
            signals.latency_ewma = sample;
        } else {
            signals.latency_ewma =
                LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * signals.latency_ewma;
        }

        if signals.success_ewma == 0.0 {
            signals.success_ewma = 1.0;
        }
        let value = if success { 1.0 } else { 0.0 };
        signals.success_ewma =
            SUCCESS_ALPHA * value + (1.0 - SUCCESS_ALPHA) * signals.success_ewma;
    }

    /// Current latency EWMA in seconds.
    #[must_use]
    pub fn latency_ewma(&self) -> f64 {
        self.signals.lock().expect("signals lock poisoned").latency_ewma
    }

    /// Current success EWMA in `[0, 1]`.
    #[must_use]
    pub fn success_ewma(&self) -> f64 {
        self.signals.lock().expect("signals lock poisoned").success_ewma
    }

    /// Adaptive routing score; lower is better.
    ///
    /// `(latency / max(weight, 1)) * (1 / max(success, 0.1)) *
    /// (1 + active) * circuit_multiplier`, where half-open circuits double
    /// the score and open circuits push it to the maximum so the backend
    /// sorts last everywhere it is still visible (for example in the
    /// metrics view).
    #[must_use]
    pub fn score(&self) -> f64 {
        let state = self.breaker.state();
        if state == CircuitState::Open {
            return f64::MAX;
        }

        let signals = *self.signals.lock().expect("signals lock poisoned");
        let mut latency = signals.latency_ewma;
        if latency == 0.0 {
            latency = 0.1;
        }
        let success = signals.success_ewma.max(0.1);

        let base = latency / f64::from(self.weight.max(1));
        let penalty = 1.0 / success;
        #[allow(clippy::cast_precision_loss)]
        let load = 1.0 + self.active_connections() as f64;
        let multiplier = if state == CircuitState::HalfOpen {
            2.0
        } else {
            1.0
        };

        base * penalty * load * multiplier
    }

    /// The owned circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The owned upstream transport.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Read-only view for the metrics endpoint and dashboard.
    #[must_use]
    pub fn view(&self) -> BackendView {
        BackendView {
            id: self.id.clone(),
            alive: self.is_alive(),
            weight: self.weight,
            region: self.region.clone(),
            score: self.score(),
        }
    }
}

/// RAII guard pairing every connection increment with exactly one
/// decrement.
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    /// The tracked backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serializable snapshot of one backend for `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendView {
    /// Backend id.
    pub id: String,
    /// Liveness flag.
    pub alive: bool,
    /// Configured weight.
    pub weight: u32,
    /// Region tag.
    pub region: String,
    /// Current adaptive score.
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str, weight: u32, region: &str) -> Arc<Backend> {
        Arc::new(Backend::new(url, weight, region).unwrap())
    }

    #[test]
    fn test_new_backend_defaults() {
        let b = backend("http://localhost:8081", 3, "us-east");
        assert_eq!(b.id(), "http://localhost:8081");
        assert_eq!(b.weight(), 3);
        assert_eq!(b.region(), "us-east");
        assert!(b.is_alive());
        assert!(b.is_selectable());
        assert_eq!(b.active_connections(), 0);
        assert_eq!(b.probe_addr(), "localhost:8081");
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(Backend::new("http://", 1, "").is_err());
    }

    #[test]
    fn test_set_alive_returns_previous() {
        let b = backend("http://localhost:8081", 1, "");
        assert!(b.set_alive(false));
        assert!(!b.is_alive());
        assert!(!b.is_selectable());
        assert!(!b.set_alive(true));
    }

    #[test]
    fn test_connection_guard_pairs_increments() {
        let b = backend("http://localhost:8081", 1, "");

        {
            let _g1 = b.track_connection();
            let _g2 = b.track_connection();
            assert_eq!(b.active_connections(), 2);
        }
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn test_connection_guard_survives_panic() {
        let b = backend("http://localhost:8081", 1, "");
        let b2 = Arc::clone(&b);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = b2.track_connection();
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn test_ewma_seeding_and_decay() {
        let b = backend("http://localhost:8081", 1, "");

        b.record_metrics(Duration::from_millis(100), true);
        assert!((b.latency_ewma() - 0.1).abs() < 1e-9);
        // success seeded to 1.0, then one successful observation
        assert!((b.success_ewma() - 1.0).abs() < 1e-9);

        b.record_metrics(Duration::from_millis(200), false);
        // 0.2 * 0.2 + 0.8 * 0.1 = 0.12
        assert!((b.latency_ewma() - 0.12).abs() < 1e-9);
        // 0.1 * 0.0 + 0.9 * 1.0 = 0.9
        assert!((b.success_ewma() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_score_prefers_fast_and_weighted() {
        let fast = backend("http://localhost:8081", 3, "");
        let slow = backend("http://localhost:8082", 1, "");

        fast.record_metrics(Duration::from_millis(50), true);
        slow.record_metrics(Duration::from_millis(500), true);

        assert!(fast.score() < slow.score());
    }

    #[test]
    fn test_score_penalizes_load() {
        let b = backend("http://localhost:8081", 1, "");
        b.record_metrics(Duration::from_millis(100), true);
        let idle = b.score();

        let _guard = b.track_connection();
        assert!(b.score() > idle);
    }

    #[test]
    fn test_score_unprobed_backend_uses_floor() {
        let b = backend("http://localhost:8081", 1, "");
        // latency floor 0.1, success floor from seeding path
        assert!((b.score() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_open_breaker_maximizes_score_and_blocks_selection() {
        let b = backend("http://localhost:8081", 1, "");

        for _ in 0..5 {
            let _ = b.breaker().call(async { Err::<(), _>("down") }).await;
        }

        assert_eq!(b.breaker().state(), CircuitState::Open);
        assert!(!b.is_selectable());
        assert!(b.is_alive());
        assert_eq!(b.score(), f64::MAX);
    }

    #[test]
    fn test_view_snapshot() {
        let b = backend("http://localhost:8081", 2, "asia");
        let view = b.view();
        assert_eq!(view.id, "http://localhost:8081");
        assert!(view.alive);
        assert_eq!(view.weight, 2);
        assert_eq!(view.region, "asia");
    }
}
