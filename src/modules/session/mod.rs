//! # Session Module
//!
//! Sticky-session state shared with an external key-value store. The
//! store is a narrow capability ([`SharedStore`]) so the in-memory
//! implementation used locally and a networked store in production are
//! interchangeable; the [`StickySessionManager`] layers the key schema,
//! JSON encoding, and TTL handling on top.
//!
//! Store failures never fail a request: callers log at WARN and fall back
//! to their local cache.

pub mod error;
pub mod manager;
pub mod store;

pub use error::{SessionError, SessionResult};
pub use manager::{SessionData, StickySessionManager};
pub use store::{MemoryStore, RedisStore, SharedStore, StoreFuture};
