//! # Rate Limiting Module
//!
//! Per-client token-bucket admission control, applied before any backend
//! work. Each client key owns a bucket with a fixed capacity and refill
//! rate; fresh buckets start with a warmup credit so a restarted balancer
//! does not immediately deny established clients.

pub mod bucket;
pub mod config;
pub mod limiter;

pub use bucket::TokenBucket;
pub use config::RateLimitConfig;
pub use limiter::{client_key, RateLimiter};
