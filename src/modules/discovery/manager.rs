//! Discovery watch loop feeding the server pool.

use super::catalog::{CatalogEvent, ServiceInstance};
use crate::modules::server_pool::{Backend, ServerPool};
use crate::modules::upstream::UpstreamResult;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Builds a backend (breaker, transport) from a discovered instance.
pub type BackendFactory =
    Box<dyn Fn(&ServiceInstance) -> UpstreamResult<Arc<Backend>> + Send + Sync>;

/// Long-lived task applying catalog snapshots to the pool.
///
/// On each snapshot the pool is rebuilt atomically: surviving backends
/// keep their record, new ones are constructed through the factory, and
/// removed ones drain as their in-flight requests complete. Catalog
/// errors are logged and the last known set stays in effect.
pub struct DiscoveryManager {
    pool: Arc<ServerPool>,
    factory: BackendFactory,
    events: mpsc::Receiver<CatalogEvent>,
    shutdown: mpsc::Receiver<()>,
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager").finish_non_exhaustive()
    }
}

impl DiscoveryManager {
    /// Create a manager consuming `events`.
    #[must_use]
    pub fn new(
        pool: Arc<ServerPool>,
        factory: BackendFactory,
        events: mpsc::Receiver<CatalogEvent>,
        shutdown: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            pool,
            factory,
            events,
            shutdown,
        }
    }

    /// Run the watch loop until shutdown or stream end.
    pub async fn run(mut self) {
        info!("Starting discovery watch loop");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    debug!("Discovery manager shutting down");
                    break;
                }
                event = self.events.recv() => {
                    match event {
                        Some(CatalogEvent::Snapshot(instances)) => {
                            self.apply(&instances);
                        },
                        Some(CatalogEvent::Error(e)) => {
                            error!(error = %e, "Discovery update failed, retaining last known backend set");
                        },
                        None => {
                            error!("Discovery watch stream closed, retaining last known backend set");
                            break;
                        },
                    }
                }
            }
        }
    }

    /// Apply one snapshot to the pool.
    fn apply(&self, instances: &[ServiceInstance]) {
        let mut next = Vec::with_capacity(instances.len());

        for instance in instances {
            match (self.factory)(instance) {
                Ok(backend) => next.push(backend),
                Err(e) => {
                    warn!(instance = %instance.id, error = %e, "Skipping undialable discovered instance");
                },
            }
        }

        self.pool.rebuild(next);
    }
}
