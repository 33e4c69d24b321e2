//! Service catalog capability and the in-memory implementation.

use super::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

/// One service instance discovered in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Stable instance id.
    pub id: String,
    /// Host name or address.
    pub address: String,
    /// Service port.
    pub port: u16,
    /// Relative routing weight.
    pub weight: u32,
    /// Region tag.
    #[serde(default)]
    pub region: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ServiceInstance {
    /// Backend URL for this instance.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Event on a catalog watch stream.
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    /// A full snapshot of the current instance set.
    Snapshot(Vec<ServiceInstance>),
    /// The catalog reported a failure; the last set stays in effect.
    Error(DiscoveryError),
}

/// A service catalog that can be watched for instance-set changes.
pub trait ServiceCatalog: Send + Sync + std::fmt::Debug {
    /// Subscribe to snapshots. The current set is delivered first,
    /// followed by one event per change.
    fn subscribe(&self) -> mpsc::Receiver<CatalogEvent>;
}

/// In-memory catalog for local use and tests.
///
/// Snapshots are published explicitly; every subscriber receives the
/// current set on subscription and each later publication.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    instances: RwLock<Vec<ServiceInstance>>,
    subscribers: Mutex<Vec<mpsc::Sender<CatalogEvent>>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a catalog pre-populated with instances.
    #[must_use]
    pub fn with_instances(instances: Vec<ServiceInstance>) -> Self {
        Self {
            instances: RwLock::new(instances),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current instance set.
    #[must_use]
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.instances.read().expect("catalog lock poisoned").clone()
    }

    /// Publish a new snapshot to all subscribers.
    pub fn publish(&self, instances: Vec<ServiceInstance>) {
        *self.instances.write().expect("catalog lock poisoned") = instances.clone();

        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers
            .retain(|tx| tx.try_send(CatalogEvent::Snapshot(instances.clone())).is_ok());
    }

    /// Publish a catalog failure to all subscribers.
    pub fn publish_error(&self, error: DiscoveryError) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|tx| tx.try_send(CatalogEvent::Error(error.clone())).is_ok());
    }
}

impl ServiceCatalog for MemoryCatalog {
    fn subscribe(&self) -> mpsc::Receiver<CatalogEvent> {
        let (tx, rx) = mpsc::channel(16);
        let current = self.instances();
        let _ = tx.try_send(CatalogEvent::Snapshot(current));

        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, port: u16, weight: u32, region: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            address: "localhost".to_string(),
            port,
            weight,
            region: region.to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_instance_url() {
        let inst = instance("web-1", 8081, 3, "us-east");
        assert_eq!(inst.url(), "http://localhost:8081");
    }

    #[tokio::test]
    async fn test_subscribe_delivers_current_set() {
        let catalog = MemoryCatalog::with_instances(vec![instance("web-1", 8081, 3, "us-east")]);

        let mut rx = catalog.subscribe();
        match rx.recv().await.unwrap() {
            CatalogEvent::Snapshot(set) => {
                assert_eq!(set.len(), 1);
                assert_eq!(set[0].id, "web-1");
            },
            CatalogEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let catalog = MemoryCatalog::new();
        let mut rx = catalog.subscribe();

        // Drain the initial empty snapshot.
        assert!(matches!(
            rx.recv().await.unwrap(),
            CatalogEvent::Snapshot(set) if set.is_empty()
        ));

        catalog.publish(vec![instance("web-2", 8082, 2, "us-west")]);
        match rx.recv().await.unwrap() {
            CatalogEvent::Snapshot(set) => assert_eq!(set[0].id, "web-2"),
            CatalogEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    #[tokio::test]
    async fn test_publish_error_event() {
        let catalog = MemoryCatalog::new();
        let mut rx = catalog.subscribe();
        let _ = rx.recv().await;

        catalog.publish_error(DiscoveryError::CatalogUnavailable("down".to_string()));
        assert!(matches!(rx.recv().await.unwrap(), CatalogEvent::Error(_)));
    }
}
