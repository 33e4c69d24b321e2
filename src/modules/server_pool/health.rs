//! Periodic liveness probing over the pool.

use super::config::HealthConfig;
use super::pool::ServerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Background prober that marks backends alive or dead.
///
/// Each cycle takes a snapshot of the pool (the pool lock is released
/// before any dialing) and sequentially opens a TCP connection to every
/// backend with a short timeout, closing it immediately on success.
#[derive(Debug)]
pub struct HealthProber {
    pool: Arc<ServerPool>,
    config: HealthConfig,
    shutdown: mpsc::Receiver<()>,
}

impl HealthProber {
    /// Create a prober over `pool`.
    #[must_use]
    pub fn new(pool: Arc<ServerPool>, config: HealthConfig, shutdown: mpsc::Receiver<()>) -> Self {
        Self {
            pool,
            config,
            shutdown,
        }
    }

    /// Run the probe loop until shutdown.
    pub async fn run(mut self) {
        if !self.config.enabled {
            debug!("Health probing disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval_secs,
            "Starting health probe loop"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("Health prober shutting down");
                    break;
                }
                () = tokio::time::sleep(self.config.interval()) => {
                    Self::probe_pool(&self.pool, self.config.timeout()).await;
                }
            }
        }
    }

    /// Probe every backend in the pool once.
    pub async fn probe_pool(pool: &ServerPool, connect_timeout: Duration) {
        let backends = pool.backends();
        let mut alive = 0usize;

        for backend in &backends {
            let addr = backend.probe_addr();
            let up = matches!(
                timeout(connect_timeout, TcpStream::connect(&addr)).await,
                Ok(Ok(_))
            );

            let was_alive = backend.set_alive(up);
            if up {
                alive += 1;
                if !was_alive {
                    info!(backend = %backend.id(), "Backend recovered");
                }
            } else if was_alive {
                warn!(backend = %backend.id(), "Backend is DOWN");
            }
        }

        debug!(alive, total = backends.len(), "Health probe cycle complete");
    }
}
