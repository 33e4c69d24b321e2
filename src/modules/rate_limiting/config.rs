//! Rate limiter configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the per-client rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (maximum burst).
    pub capacity: u32,

    /// Refill rate in tokens per second.
    pub refill_per_second: u32,

    /// Grant fresh buckets a warmup credit of `3 * capacity` free
    /// admissions. Avoids cold-start denial after a restart.
    pub warmup: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 5,
            warmup: true,
        }
    }
}

impl RateLimitConfig {
    /// Warmup credit granted to a fresh bucket.
    #[must_use]
    pub fn warmup_credit(&self) -> u32 {
        if self.warmup {
            self.capacity * 3
        } else {
            0
        }
    }
}
