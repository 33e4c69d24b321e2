//! The balancer's HTTP front end.

use super::handler::Dispatcher;
use crate::modules::metrics::LbMetrics;
use crate::modules::server_pool::ServerPool;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// HTTP server exposing the proxy endpoint and the read-only views.
///
/// Routes: `/lb` (proxied traffic), `/health` (readiness), `/metrics`
/// (JSON backend views), `/prometheus` (text exposition), `/` (status
/// dashboard).
#[derive(Debug)]
pub struct FrontEnd {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<LbMetrics>,
    shutdown: mpsc::Receiver<()>,
}

impl FrontEnd {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns the bind error (fatal at startup).
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<Dispatcher>,
        metrics: Arc<LbMetrics>,
        shutdown: mpsc::Receiver<()>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Load balancer listening");

        Ok(Self {
            listener,
            dispatcher,
            metrics,
            shutdown,
        })
    }

    /// The bound address (useful when binding port 0).
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until shutdown.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let dispatcher = Arc::clone(&self.dispatcher);
                            let metrics = Arc::clone(&self.metrics);

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let dispatcher = Arc::clone(&dispatcher);
                                    let metrics = Arc::clone(&metrics);
                                    async move { route(req, peer, &dispatcher, &metrics).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(TokioIo::new(stream), service)
                                    .await
                                {
                                    debug!(error = %e, "Connection error");
                                }
                            });
                        },
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        },
                    }
                }
                _ = self.shutdown.recv() => {
                    info!("Front end shutting down");
                    break;
                }
            }
        }
    }
}

/// Route one request by path.
async fn route(
    req: Request<Incoming>,
    peer: SocketAddr,
    dispatcher: &Dispatcher,
    metrics: &LbMetrics,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let pool = dispatcher.pool();

    let resp = match req.uri().path() {
        "/lb" => dispatcher.dispatch(req, peer).await,
        "/health" => health_response(pool),
        "/metrics" => metrics_response(pool),
        "/prometheus" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            metrics.encode(),
        ),
        "/" => text_response(
            StatusCode::OK,
            "text/html; charset=utf-8",
            dashboard_html(pool, metrics),
        ),
        _ => text_response(
            StatusCode::NOT_FOUND,
            "text/plain; charset=utf-8",
            "Not Found".to_string(),
        ),
    };

    Ok(resp)
}

/// 200 while at least one backend is selectable, else 503.
fn health_response(pool: &ServerPool) -> Response<Full<Bytes>> {
    if pool.selectable_count() > 0 {
        text_response(StatusCode::OK, "text/plain; charset=utf-8", "OK".to_string())
    } else {
        text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain; charset=utf-8",
            "No healthy backends".to_string(),
        )
    }
}

/// JSON array of per-backend views.
fn metrics_response(pool: &ServerPool) -> Response<Full<Bytes>> {
    match serde_json::to_string(&pool.views()) {
        Ok(body) => text_response(StatusCode::OK, "application/json", body),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics JSON");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                "Internal server error".to_string(),
            )
        },
    }
}

/// Minimal status dashboard.
fn dashboard_html(pool: &ServerPool, metrics: &LbMetrics) -> String {
    let views = pool.views();
    let healthy = views.iter().filter(|v| v.alive).count();

    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>Helmsman Dashboard</title>\n\
         <meta http-equiv=\"refresh\" content=\"5\">\n\
         <style>\n\
         body { font-family: sans-serif; margin: 2em; }\n\
         table { border-collapse: collapse; }\n\
         td, th { border: 1px solid #ccc; padding: 0.4em 0.8em; }\n\
         .up { color: #28a745; } .down { color: #dc3545; }\n\
         </style>\n</head>\n<body>\n<h1>Helmsman</h1>\n",
    );

    let _ = write!(
        html,
        "<p>Total requests: {} &middot; Backends: {} &middot; Healthy: {}</p>\n\
         <table>\n<tr><th>Backend</th><th>Status</th><th>Weight</th>\
         <th>Region</th><th>Score</th></tr>\n",
        metrics.requests_overall(),
        views.len(),
        healthy,
    );

    for view in &views {
        let (class, label) = if view.alive { ("up", "UP") } else { ("down", "DOWN") };
        let _ = write!(
            html,
            "<tr><td>{}</td><td class=\"{}\">{}</td><td>{}</td><td>{}</td><td>{:.4}</td></tr>\n",
            view.id, class, label, view.weight, view.region, view.score,
        );
    }

    html.push_str("</table>\n</body>\n</html>\n");
    html
}

fn text_response(
    status: StatusCode,
    content_type: &str,
    body: String,
) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", content_type)
        .body(Full::new(Bytes::from(body)))
        .expect("static response build failed")
}
