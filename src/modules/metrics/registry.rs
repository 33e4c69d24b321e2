//! Prometheus metric registry and families.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Labels for the request counter.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    /// Backend id (its URL).
    pub backend: String,
    /// HTTP status code as text.
    pub status: String,
}

/// Labels for per-backend gauges and histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BackendLabels {
    /// Backend id (its URL).
    pub backend: String,
}

/// Metric families exposed on the `/prometheus` endpoint.
pub struct LbMetrics {
    registry: Registry,
    requests: Family<RequestLabels, Counter>,
    connections: Family<BackendLabels, Gauge<f64, AtomicU64>>,
    duration: Family<BackendLabels, Histogram>,
    requests_overall: AtomicU64,
}

impl std::fmt::Debug for LbMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LbMetrics")
            .field("requests_overall", &self.requests_overall)
            .finish_non_exhaustive()
    }
}

impl LbMetrics {
    /// Create and register all metric families.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let requests = Family::<RequestLabels, Counter>::default();
        registry.register(
            "loadbalancer_requests",
            "Total number of requests processed by the load balancer",
            requests.clone(),
        );

        let connections = Family::<BackendLabels, Gauge<f64, AtomicU64>>::default();
        registry.register(
            "loadbalancer_z_backend_connections",
            "Number of active connections to each backend",
            connections.clone(),
        );

        let duration = Family::<BackendLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(exponential_buckets(0.005, 2.0, 12))
        });
        registry.register(
            "loadbalancer_z_request_duration_seconds",
            "Request duration in seconds",
            duration.clone(),
        );

        Self {
            registry,
            requests,
            connections,
            duration,
            requests_overall: AtomicU64::new(0),
        }
    }

    /// Record a completed request.
    pub fn record_request(&self, backend: &str, status: u16, elapsed: Duration) {
        self.requests_overall.fetch_add(1, Ordering::Relaxed);
        self.requests
            .get_or_create(&RequestLabels {
                backend: backend.to_string(),
                status: status.to_string(),
            })
            .inc();
        self.duration
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Update the active-connection gauge for a backend.
    pub fn set_connections(&self, backend: &str, count: i64) {
        #[allow(clippy::cast_precision_loss)]
        self.connections
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .set(count as f64);
    }

    /// Pre-register the label sets for a backend so it appears in the
    /// exposition before serving its first request.
    pub fn touch_backend(&self, backend: &str) {
        self.connections
            .get_or_create(&BackendLabels {
                backend: backend.to_string(),
            })
            .set(0.0);
    }

    /// Total requests recorded since startup.
    #[must_use]
    pub fn requests_overall(&self) -> u64 {
        self.requests_overall.load(Ordering::Relaxed)
    }

    /// Encode all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut output = String::new();
        // Encoding into a String cannot fail.
        let _ = encode(&mut output, &self.registry);
        output
    }
}

impl Default for LbMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_appears_in_exposition() {
        let metrics = LbMetrics::new();
        metrics.record_request("http://localhost:8081", 200, Duration::from_millis(12));
        metrics.record_request("http://localhost:8081", 200, Duration::from_millis(20));
        metrics.record_request("http://localhost:8081", 502, Duration::from_millis(5));

        let output = metrics.encode();
        assert!(output.contains("loadbalancer_requests_total"));
        assert!(output.contains("backend=\"http://localhost:8081\""));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("status=\"502\""));
        assert_eq!(metrics.requests_overall(), 3);
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = LbMetrics::new();
        metrics.set_connections("http://localhost:8082", 7);

        let output = metrics.encode();
        assert!(output.contains("loadbalancer_z_backend_connections"));
        assert!(output.contains("7.0") || output.contains(" 7"));
    }

    #[test]
    fn test_duration_histogram_registered() {
        let metrics = LbMetrics::new();
        metrics.record_request("http://localhost:8083", 200, Duration::from_millis(50));

        let output = metrics.encode();
        assert!(output.contains("loadbalancer_z_request_duration_seconds"));
        assert!(output.contains("_bucket"));
    }

    #[test]
    fn test_touch_backend_preregisters() {
        let metrics = LbMetrics::new();
        metrics.touch_backend("http://localhost:9000");

        let output = metrics.encode();
        assert!(output.contains("http://localhost:9000"));
    }
}
