//! # Upstream Module
//!
//! The transport capability a backend proxies through. The transport is
//! chosen once at backend construction: plain TCP, or a TLS client
//! carrying an mTLS identity loaded from PEM files. The proxy call
//! rewrites the request for the backend origin, forwards it over a fresh
//! upstream connection, and classifies failures for the dispatcher.

pub mod config;
pub mod error;
pub mod transport;

pub use config::MtlsConfig;
pub use error::{UpstreamError, UpstreamResult};
pub use transport::{proxy_request, Origin, Scheme, Transport};
