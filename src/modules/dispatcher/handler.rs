//! Per-request dispatch pipeline.

use super::error::DispatchError;
use crate::modules::circuit_breaker::BreakerError;
use crate::modules::metrics::LbMetrics;
use crate::modules::policy::{PolicyDecision, PolicyRequest, TrafficPolicyEngine};
use crate::modules::rate_limiting::{client_key, RateLimiter};
use crate::modules::server_pool::{Backend, ServerPool};
use crate::modules::upstream::{proxy_request, UpstreamError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::{Request, Response, StatusCode};
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sticky-session cookie name. The exact spelling (hyphen and
/// underscore) is load-bearing for compatibility with existing clients
/// and must never be normalized.
pub const SESSION_COOKIE: &str = "LOAD-BALANCING_SESSION";

/// Session cookie lifetime in seconds.
const SESSION_COOKIE_MAX_AGE: u32 = 3600;

/// Length of minted session tokens.
const SESSION_TOKEN_LEN: usize = 24;

/// The per-request glue: rate check, selection, breaker-wrapped proxy
/// call, outcome recording.
#[derive(Debug)]
pub struct Dispatcher {
    pool: Arc<ServerPool>,
    limiter: Arc<RateLimiter>,
    policies: Option<Arc<TrafficPolicyEngine>>,
    metrics: Arc<LbMetrics>,
    request_counter: Arc<AtomicI64>,
    upstream_deadline: Duration,
}

impl Dispatcher {
    /// Create a dispatcher without a policy engine and with the default
    /// 30 second upstream deadline.
    #[must_use]
    pub fn new(
        pool: Arc<ServerPool>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<LbMetrics>,
        request_counter: Arc<AtomicI64>,
    ) -> Self {
        Self {
            pool,
            limiter,
            policies: None,
            metrics,
            request_counter,
            upstream_deadline: Duration::from_secs(30),
        }
    }

    /// Attach a traffic policy engine.
    #[must_use]
    pub fn with_policies(mut self, engine: Arc<TrafficPolicyEngine>) -> Self {
        self.policies = Some(engine);
        self
    }

    /// Override the upstream call deadline.
    #[must_use]
    pub fn with_upstream_deadline(mut self, deadline: Duration) -> Self {
        self.upstream_deadline = deadline;
        self
    }

    /// The pool this dispatcher routes over.
    #[must_use]
    pub fn pool(&self) -> &Arc<ServerPool> {
        &self.pool
    }

    /// Handle one proxied request end to end.
    pub async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let forwarded_for = header_str(&req, "x-forwarded-for");
        let client = client_key(forwarded_for.as_deref(), peer);

        if !self.limiter.allow(&client) {
            return error_response(&DispatchError::RateLimited { client }, None);
        }
        self.request_counter.fetch_add(1, Ordering::Relaxed);

        let region = client_region(&req, &client);
        let (session_id, minted_cookie) = self.session_identity(&req);

        let backend = match self.select_backend(&req, &client, &region, &session_id).await {
            Ok(backend) => backend,
            Err(e) => return error_response(&e, minted_cookie.as_ref()),
        };

        debug!(
            backend = %backend.id(),
            session = %session_id,
            breaker = %backend.breaker().state(),
            "Routing request"
        );

        let outcome = self.execute(&backend, req, &client).await;

        match outcome {
            Ok(mut resp) => {
                if let Some(cookie) = minted_cookie {
                    resp.headers_mut().append(SET_COOKIE, cookie);
                }
                resp
            },
            Err(e) => {
                warn!(backend = %backend.id(), error = %e, "Proxy call failed");
                error_response(&e, minted_cookie.as_ref())
            },
        }
    }

    /// Walk the selection chain: existing sticky mapping, policy engine,
    /// adaptive assignment (which pins the session), weighted fallback.
    async fn select_backend(
        &self,
        req: &Request<Incoming>,
        client_ip: &str,
        region: &str,
        session_id: &str,
    ) -> Result<Arc<Backend>, DispatchError> {
        if let Some(backend) = self.pool.lookup_sticky(session_id).await {
            return Ok(backend);
        }

        if let Some(engine) = &self.policies {
            let policy_request = policy_request(req, client_ip, region);
            match engine.evaluate(&policy_request) {
                PolicyDecision::Route(backend) => {
                    self.pool.pin_session(session_id, &backend, region).await;
                    return Ok(backend);
                },
                PolicyDecision::Deny { policy } => {
                    return Err(DispatchError::PolicyDenied { policy });
                },
                PolicyDecision::Pass => {},
            }
        }

        if let Some(backend) = self.pool.resolve_sticky(session_id, region).await {
            return Ok(backend);
        }

        if let Some(backend) = self.pool.select_weighted() {
            self.pool.pin_session(session_id, &backend, region).await;
            return Ok(backend);
        }

        // Nothing is selectable. If some alive backend is refusing
        // traffic because its circuit is open, say so explicitly.
        if let Some(open) = self
            .pool
            .backends()
            .into_iter()
            .find(|b| b.is_alive() && !b.is_selectable())
        {
            return Err(DispatchError::CircuitOpen {
                backend: open.id().to_string(),
            });
        }

        Err(DispatchError::NoSelectableBackend)
    }

    /// Execute the proxy call through the backend's circuit breaker,
    /// then fold the outcome into the EWMAs and metric families.
    async fn execute(
        &self,
        backend: &Arc<Backend>,
        req: Request<Incoming>,
        client_ip: &str,
    ) -> Result<Response<Full<Bytes>>, DispatchError> {
        let guard = backend.track_connection();
        let start = Instant::now();
        let deadline = self.upstream_deadline;

        let result = backend
            .breaker()
            .call_classified(
                async {
                    let exchange = async {
                        let resp =
                            proxy_request(backend.transport(), backend.origin(), req, client_ip)
                                .await?;
                        let (parts, body) = resp.into_parts();
                        let bytes = body
                            .collect()
                            .await
                            .map_err(|e| UpstreamError::Transport(e.to_string()))?
                            .to_bytes();
                        Ok(Response::from_parts(parts, Full::new(bytes)))
                    };

                    match tokio::time::timeout(deadline, exchange).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(UpstreamError::Timeout),
                    }
                },
                |outcome: &Result<Response<Full<Bytes>>, UpstreamError>| {
                    matches!(outcome, Ok(resp) if resp.status().as_u16() < 500)
                },
            )
            .await;

        let elapsed = start.elapsed();
        drop(guard);
        self.metrics
            .set_connections(backend.id(), backend.active_connections());

        let (status, success) = match &result {
            Ok(resp) => (resp.status().as_u16(), resp.status().as_u16() < 500),
            Err(BreakerError::Open) => (503, false),
            Err(BreakerError::Inner(e)) => (e.status_code(), false),
        };

        backend.record_metrics(elapsed, success);
        self.metrics.record_request(backend.id(), status, elapsed);

        match result {
            Ok(resp) => Ok(resp),
            Err(BreakerError::Open) => Err(DispatchError::CircuitOpen {
                backend: backend.id().to_string(),
            }),
            Err(BreakerError::Inner(e)) => Err(DispatchError::Upstream(e)),
        }
    }

    /// Read the session cookie, minting a fresh token (and its
    /// `Set-Cookie` header) when the client has none.
    fn session_identity(&self, req: &Request<Incoming>) -> (String, Option<HeaderValue>) {
        if let Some(existing) = session_cookie(req) {
            return (existing, None);
        }

        let token = mint_session_token();
        let cookie = format!(
            "{SESSION_COOKIE}={token}; Path=/; Max-Age={SESSION_COOKIE_MAX_AGE}; HttpOnly"
        );
        let header = HeaderValue::from_str(&cookie).ok();
        (token, header)
    }
}

/// Build the policy engine's view of a request.
fn policy_request(req: &Request<Incoming>, client_ip: &str, region: &str) -> PolicyRequest {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }

    PolicyRequest {
        path: req.uri().path().to_string(),
        region: region.to_string(),
        client_ip: client_ip.to_string(),
        user_agent: headers.get("user-agent").cloned().unwrap_or_default(),
        headers,
    }
}

/// Resolve the client's region: explicit headers first, then the
/// `region` query parameter, finally a reserved-range heuristic on the
/// client IP.
fn client_region<B>(req: &Request<B>, client_ip: &str) -> String {
    for header in ["x-client-region", "x-geo-region"] {
        if let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) {
            let region = value.trim().to_lowercase();
            if !region.is_empty() {
                return region;
            }
        }
    }

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some((key, value)) = pair.split_once('=') {
                if key == "region" && !value.trim().is_empty() {
                    return value.trim().to_lowercase();
                }
            }
        }
    }

    if client_ip.starts_with("10.") || client_ip.starts_with("192.168.") {
        "us-east".to_string()
    } else if client_ip.starts_with("172.") {
        "us-west".to_string()
    } else {
        "default".to_string()
    }
}

/// Extract the sticky-session cookie value, if present.
fn session_cookie<B>(req: &Request<B>) -> Option<String> {
    for header in req.headers().get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some(value) = pair.trim().strip_prefix(SESSION_COOKIE) {
                if let Some(value) = value.strip_prefix('=') {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}

/// Mint an opaque session token.
fn mint_session_token() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(SESSION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn header_str<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// Build the minimal error response for a classified failure.
fn error_response(error: &DispatchError, cookie: Option<&HeaderValue>) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut resp = Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(error.body().as_bytes())))
        .expect("static response build failed");

    if let Some(cookie) = cookie {
        resp.headers_mut().append(SET_COOKIE, cookie.clone());
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(headers: &[(&str, &str)], uri: &str) -> Request<Full<Bytes>> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    #[test]
    fn test_region_from_headers_in_order() {
        let req = request_with(
            &[("X-Client-Region", "US-West"), ("X-Geo-Region", "asia")],
            "/lb",
        );
        assert_eq!(client_region(&req, "203.0.113.5"), "us-west");

        let req = request_with(&[("X-Geo-Region", "Asia")], "/lb");
        assert_eq!(client_region(&req, "203.0.113.5"), "asia");
    }

    #[test]
    fn test_region_from_query_param() {
        let req = request_with(&[], "/lb?region=eu-central&x=1");
        assert_eq!(client_region(&req, "203.0.113.5"), "eu-central");
    }

    #[test]
    fn test_region_from_ip_heuristic() {
        let req = request_with(&[], "/lb");
        assert_eq!(client_region(&req, "10.1.2.3"), "us-east");
        assert_eq!(client_region(&req, "192.168.0.9"), "us-east");
        assert_eq!(client_region(&req, "172.16.0.1"), "us-west");
        assert_eq!(client_region(&req, "203.0.113.5"), "default");
    }

    #[test]
    fn test_session_cookie_parsing() {
        let req = request_with(
            &[("Cookie", "theme=dark; LOAD-BALANCING_SESSION=tok123; x=y")],
            "/lb",
        );
        assert_eq!(session_cookie(&req), Some("tok123".to_string()));

        let req = request_with(&[("Cookie", "theme=dark")], "/lb");
        assert_eq!(session_cookie(&req), None);
    }

    #[test]
    fn test_cookie_name_is_exact() {
        // The hyphen/underscore mix is part of the wire contract.
        assert_eq!(SESSION_COOKIE, "LOAD-BALANCING_SESSION");
    }

    #[test]
    fn test_minted_tokens_are_unique_and_long() {
        let a = mint_session_token();
        let b = mint_session_token();
        assert_ne!(a, b);
        assert!(a.len() >= 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_error_response_carries_cookie() {
        let cookie = HeaderValue::from_static("LOAD-BALANCING_SESSION=t; Path=/");
        let resp = error_response(&DispatchError::NoSelectableBackend, Some(&cookie));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().get(SET_COOKIE).is_some());
    }
}
