//! Keyed rate limiter over per-client token buckets.

use super::bucket::TokenBucket;
use super::config::RateLimitConfig;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-client rate limiter.
///
/// The bucket map is guarded by a single mutex; the critical section is a
/// map lookup plus constant-time arithmetic, so contention stays low even
/// under high request concurrency.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    total_checks: AtomicU64,
    total_denied: AtomicU64,
}

impl RateLimiter {
    /// Create a rate limiter with the given configuration.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            total_checks: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        }
    }

    /// Create a rate limiter with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RateLimitConfig::default())
    }

    /// Check whether a request from `key` is admitted.
    pub fn allow(&self, key: &str) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket map lock poisoned");

        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            TokenBucket::new(self.config.capacity, self.config.warmup_credit())
        });

        let allowed = bucket.allow(
            self.config.capacity,
            f64::from(self.config.refill_per_second),
            now,
        );
        drop(buckets);

        if !allowed {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!(client = %key, "Rate limit exceeded");
        }

        allowed
    }

    /// Evict buckets idle for longer than `max_idle`.
    pub fn cleanup(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket map lock poisoned");
        buckets.retain(|_, bucket| now.duration_since(bucket.last_used()) < max_idle);
    }

    /// Number of live buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("bucket map lock poisoned").len()
    }

    /// Total admission checks performed.
    #[must_use]
    pub fn total_checks(&self) -> u64 {
        self.total_checks.load(Ordering::Relaxed)
    }

    /// Total denials.
    #[must_use]
    pub fn total_denied(&self) -> u64 {
        self.total_denied.load(Ordering::Relaxed)
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

/// Derive the rate-limit key for a request: the first `X-Forwarded-For`
/// entry when present, otherwise the host part of the peer address.
#[must_use]
pub fn client_key(forwarded_for: Option<&str>, peer: SocketAddr) -> String {
    if let Some(xff) = forwarded_for {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    peer.ip().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_warmup(capacity: u32, refill: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            capacity,
            refill_per_second: refill,
            warmup: false,
        })
    }

    #[test]
    fn test_capacity_bound() {
        let limiter = no_warmup(10, 0);

        for _ in 0..10 {
            assert!(limiter.allow("1.2.3.4"));
        }
        assert!(!limiter.allow("1.2.3.4"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = no_warmup(2, 0);

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        // A different client still has a full bucket.
        assert!(limiter.allow("b"));
    }

    #[test]
    fn test_warmup_admissions() {
        let limiter = RateLimiter::new(RateLimitConfig {
            capacity: 2,
            refill_per_second: 0,
            warmup: true,
        });

        // 3 * capacity warmup plus the initial bucket fill.
        for _ in 0..8 {
            assert!(limiter.allow("c"));
        }
        assert!(!limiter.allow("c"));
    }

    #[test]
    fn test_refill_admits_after_wait() {
        let limiter = no_warmup(2, 100);

        assert!(limiter.allow("d"));
        assert!(limiter.allow("d"));
        assert!(!limiter.allow("d"));

        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.allow("d"));
    }

    #[test]
    fn test_stats() {
        let limiter = no_warmup(1, 0);
        limiter.allow("e");
        limiter.allow("e");

        assert_eq!(limiter.total_checks(), 2);
        assert_eq!(limiter.total_denied(), 1);
    }

    #[test]
    fn test_cleanup_evicts_idle() {
        let limiter = no_warmup(1, 0);
        limiter.allow("f");
        limiter.allow("g");
        assert_eq!(limiter.bucket_count(), 2);

        limiter.cleanup(Duration::ZERO);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let peer: SocketAddr = "203.0.113.9:5000".parse().unwrap();

        assert_eq!(
            client_key(Some("198.51.100.1, 10.0.0.1"), peer),
            "198.51.100.1"
        );
        assert_eq!(client_key(Some(" 198.51.100.2 "), peer), "198.51.100.2");
        assert_eq!(client_key(None, peer), "203.0.113.9");
        assert_eq!(client_key(Some(""), peer), "203.0.113.9");
    }
}
