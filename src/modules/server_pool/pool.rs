//! The backend pool and its selection algorithms.

use super::backend::{Backend, BackendView};
use super::error::{PoolError, PoolResult};
use crate::modules::session::StickySessionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Structure {
    backends: Vec<Arc<Backend>>,
    weighted: Vec<Arc<Backend>>,
    regions: HashMap<String, Vec<Arc<Backend>>>,
}

impl Structure {
    fn index(&mut self, backend: &Arc<Backend>) {
        for _ in 0..backend.weight() {
            self.weighted.push(Arc::clone(backend));
        }
        if !backend.region().is_empty() {
            self.regions
                .entry(backend.region().to_string())
                .or_default()
                .push(Arc::clone(backend));
        }
    }
}

/// The shared pool of backends.
///
/// Structural data (backend list, weighted index, region map) sits behind
/// one reader/writer lock; selection takes a snapshot and releases the
/// lock before any scoring or network work. Writers are rare: discovery
/// rebuilds and admin add/remove.
#[derive(Debug)]
pub struct ServerPool {
    structure: RwLock<Structure>,
    cursor: AtomicU64,
    sessions: Option<Arc<StickySessionManager>>,
    /// Local session-to-backend cache, the fallback when the external
    /// store is unavailable.
    sticky_cache: RwLock<HashMap<String, String>>,
}

impl ServerPool {
    /// Create an empty pool without an external session store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            structure: RwLock::new(Structure::default()),
            cursor: AtomicU64::new(0),
            sessions: None,
            sticky_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Create an empty pool backed by a sticky-session manager.
    #[must_use]
    pub fn with_sessions(manager: Arc<StickySessionManager>) -> Self {
        Self {
            sessions: Some(manager),
            ..Self::new()
        }
    }

    /// Add a backend to the pool and its indexes.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::DuplicateBackend`] when a backend with the
    /// same id is already registered; the weighted index is untouched.
    pub fn add(&self, backend: Arc<Backend>) -> PoolResult<()> {
        let mut structure = self.structure.write().expect("pool lock poisoned");

        if structure.backends.iter().any(|b| b.id() == backend.id()) {
            return Err(PoolError::DuplicateBackend(backend.id().to_string()));
        }

        info!(backend = %backend.id(), weight = backend.weight(), region = %backend.region(), "Added backend");
        structure.index(&backend);
        structure.backends.push(backend);
        Ok(())
    }

    /// Remove a backend by id.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::BackendNotFound`] when no such backend exists.
    pub fn remove(&self, id: &str) -> PoolResult<()> {
        let mut structure = self.structure.write().expect("pool lock poisoned");

        if !structure.backends.iter().any(|b| b.id() == id) {
            return Err(PoolError::BackendNotFound(id.to_string()));
        }

        structure.backends.retain(|b| b.id() != id);
        structure.weighted.retain(|b| b.id() != id);
        for list in structure.regions.values_mut() {
            list.retain(|b| b.id() != id);
        }
        structure.regions.retain(|_, list| !list.is_empty());

        info!(backend = %id, "Removed backend");
        Ok(())
    }

    /// Atomically replace the backend set from a discovery snapshot.
    ///
    /// Backends whose id survives keep their record (liveness, EWMAs,
    /// breaker state); new ids come from `next`; removed backends drop
    /// out of the indexes, while in-flight requests hold their own
    /// references until completion.
    pub fn rebuild(&self, next: Vec<Arc<Backend>>) {
        let mut structure = self.structure.write().expect("pool lock poisoned");

        let existing: HashMap<String, Arc<Backend>> = structure
            .backends
            .iter()
            .map(|b| (b.id().to_string(), Arc::clone(b)))
            .collect();

        let mut rebuilt = Structure::default();
        for candidate in next {
            let backend = existing
                .get(candidate.id())
                .map_or(candidate, Arc::clone);
            rebuilt.index(&backend);
            rebuilt.backends.push(backend);
        }

        info!(count = rebuilt.backends.len(), "Rebuilt backend set from discovery");
        *structure = rebuilt;
    }

    /// Get a backend by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Backend>> {
        self.structure
            .read()
            .expect("pool lock poisoned")
            .backends
            .iter()
            .find(|b| b.id() == id)
            .cloned()
    }

    /// Snapshot of all backends.
    #[must_use]
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.structure
            .read()
            .expect("pool lock poisoned")
            .backends
            .clone()
    }

    /// Number of registered backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.structure.read().expect("pool lock poisoned").backends.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of currently selectable backends.
    #[must_use]
    pub fn selectable_count(&self) -> usize {
        self.backends().iter().filter(|b| b.is_selectable()).count()
    }

    /// Total weight of alive backends.
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.backends()
            .iter()
            .filter(|b| b.is_alive())
            .map(|b| u64::from(b.weight()))
            .sum()
    }

    /// Read-only views for `/metrics` and the dashboard.
    #[must_use]
    pub fn views(&self) -> Vec<BackendView> {
        self.backends().iter().map(|b| b.view()).collect()
    }

    /// Next selectable backend in round-robin order, scanning at most one
    /// full cycle from the shared cursor.
    #[must_use]
    pub fn select_round_robin(&self) -> Option<Arc<Backend>> {
        let backends = self.backends();
        Self::scan(&backends, &self.cursor)
    }

    /// Next selectable backend from the weighted index.
    ///
    /// The index holds each backend replicated `weight` times and a
    /// shared cursor strides through it, which yields near-round-robin
    /// order with exact long-run proportions rather than independent
    /// random sampling.
    #[must_use]
    pub fn select_weighted(&self) -> Option<Arc<Backend>> {
        let weighted = self
            .structure
            .read()
            .expect("pool lock poisoned")
            .weighted
            .clone();
        Self::scan(&weighted, &self.cursor)
    }

    fn scan(list: &[Arc<Backend>], cursor: &AtomicU64) -> Option<Arc<Backend>> {
        if list.is_empty() {
            return None;
        }
        let len = list.len();
        let start = (cursor.fetch_add(1, Ordering::Relaxed) as usize) % len;

        for i in 0..len {
            let backend = &list[(start + i) % len];
            if backend.is_selectable() {
                return Some(Arc::clone(backend));
            }
        }
        None
    }

    /// Region-aware adaptive selection.
    ///
    /// Requests without a concrete region (`""` or `"default"`) go
    /// through weighted selection so traffic honors configured weights.
    /// For a named region the lowest-score backend wins, falling back to
    /// scoring the whole pool when the region has no selectable backend.
    /// Ties break toward the lexicographically lower id.
    #[must_use]
    pub fn select_adaptive(&self, region: &str) -> Option<Arc<Backend>> {
        if region.is_empty() || region == "default" {
            return self.select_weighted();
        }

        let candidates = self.selectable_by_region(region);

        let mut best: Option<(f64, Arc<Backend>)> = None;
        for backend in candidates {
            let score = backend.score();
            let better = match &best {
                None => true,
                Some((best_score, best_backend)) => {
                    score < *best_score
                        || (score == *best_score && backend.id() < best_backend.id())
                },
            };
            if better {
                best = Some((score, backend));
            }
        }

        best.map(|(_, backend)| backend)
    }

    fn selectable_by_region(&self, region: &str) -> Vec<Arc<Backend>> {
        let structure = self.structure.read().expect("pool lock poisoned");

        if let Some(list) = structure.regions.get(region) {
            let regional: Vec<_> = list
                .iter()
                .filter(|b| b.is_selectable())
                .cloned()
                .collect();
            if !regional.is_empty() {
                return regional;
            }
        }

        structure
            .backends
            .iter()
            .filter(|b| b.is_selectable())
            .cloned()
            .collect()
    }

    /// Look up an existing sticky mapping, returning its backend only
    /// while that backend is still selectable.
    ///
    /// The external store is consulted first; on store failure the local
    /// cache answers instead and the error is only logged.
    pub async fn lookup_sticky(&self, session_id: &str) -> Option<Arc<Backend>> {
        if let Some(manager) = &self.sessions {
            match manager.get_session(session_id).await {
                Ok(Some(session)) => {
                    if let Some(backend) = self.get(&session.backend_url) {
                        if backend.is_selectable() {
                            return Some(backend);
                        }
                    }
                    // Pinned backend vanished or stopped being
                    // selectable; the caller re-resolves.
                    return None;
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(session = %session_id, error = %e, "Session store read failed, using local cache");
                },
            }
        }

        let cached = {
            let cache = self.sticky_cache.read().expect("sticky cache lock poisoned");
            cache.get(session_id).cloned()
        };
        let backend = self.get(&cached?)?;
        backend.is_selectable().then_some(backend)
    }

    /// Pin a session to a backend: local cache always, external store
    /// best-effort.
    pub async fn pin_session(&self, session_id: &str, backend: &Arc<Backend>, region: &str) {
        {
            let mut cache = self.sticky_cache.write().expect("sticky cache lock poisoned");
            cache.insert(session_id.to_string(), backend.id().to_string());
        }

        if let Some(manager) = &self.sessions {
            if let Err(e) = manager
                .set_session(session_id, backend.id(), region)
                .await
            {
                warn!(session = %session_id, error = %e, "Session store write failed, local cache only");
            }
        }

        debug!(session = %session_id, backend = %backend.id(), "Session pinned");
    }

    /// Resolve a sticky session: return the pinned backend while it is
    /// selectable, otherwise pick one adaptively and update the mapping.
    pub async fn resolve_sticky(&self, session_id: &str, region: &str) -> Option<Arc<Backend>> {
        if let Some(backend) = self.lookup_sticky(session_id).await {
            return Some(backend);
        }

        let backend = self.select_adaptive(region)?;
        self.pin_session(session_id, &backend, region).await;
        Some(backend)
    }
}

impl Default for ServerPool {
    fn default() -> Self {
        Self::new()
    }
}
