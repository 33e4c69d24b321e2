//! Sticky-session manager layering key schema and TTL over the store.

use super::error::{SessionError, SessionResult};
use super::store::SharedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// State stored for one sticky session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    /// Backend id the session is pinned to.
    pub backend_url: String,
    /// Region the session was resolved in.
    pub region: String,
    /// When the session was first assigned.
    pub created_at: DateTime<Utc>,
    /// Last time the session was used.
    pub last_access: DateTime<Utc>,
}

impl SessionData {
    /// Create session data pinned to `backend_url`.
    #[must_use]
    pub fn new(backend_url: impl Into<String>, region: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            backend_url: backend_url.into(),
            region: region.into(),
            created_at: now,
            last_access: now,
        }
    }
}

/// Manages sticky sessions in a [`SharedStore`].
///
/// Keys follow the flat layout `"<prefix>:session:<session id>"`; values
/// are JSON-encoded [`SessionData`] with the configured TTL.
#[derive(Debug)]
pub struct StickySessionManager {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    session_ttl: Duration,
}

impl StickySessionManager {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            session_ttl: ttl,
        }
    }

    /// The configured session TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Fetch a session and refresh its `last_access` timestamp.
    ///
    /// The refresh write is best-effort: a store failure there is logged
    /// and the (stale-timestamped) session is still returned.
    ///
    /// # Errors
    ///
    /// Returns an error when the store read fails or the payload does not
    /// decode.
    pub async fn get_session(&self, session_id: &str) -> SessionResult<Option<SessionData>> {
        let key = self.session_key(session_id);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let mut session: SessionData = serde_json::from_str(&raw)?;
        session.last_access = Utc::now();

        if let Err(e) = self.write(&key, &session).await {
            warn!(session = %session_id, error = %e, "Failed to refresh session last-access");
        }

        Ok(Some(session))
    }

    /// Pin `session_id` to `backend_url`.
    ///
    /// # Errors
    ///
    /// Returns an error when the store write fails.
    pub async fn set_session(
        &self,
        session_id: &str,
        backend_url: &str,
        region: &str,
    ) -> SessionResult<()> {
        let key = self.session_key(session_id);
        let session = SessionData::new(backend_url, region);
        self.write(&key, &session).await
    }

    /// Remove a session.
    ///
    /// # Errors
    ///
    /// Returns an error when the store delete fails.
    pub async fn delete_session(&self, session_id: &str) -> SessionResult<()> {
        self.store.delete(&self.session_key(session_id)).await
    }

    /// Whether a session exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the store lookup fails.
    pub async fn session_exists(&self, session_id: &str) -> SessionResult<bool> {
        self.store.exists(&self.session_key(session_id)).await
    }

    async fn write(&self, key: &str, session: &SessionData) -> SessionResult<()> {
        let payload = serde_json::to_string(session).map_err(SessionError::Decode)?;
        self.store.set(key, payload, self.session_ttl).await
    }

    fn session_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.key_prefix, session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::session::store::MemoryStore;

    fn manager() -> StickySessionManager {
        StickySessionManager::new(
            Arc::new(MemoryStore::new()),
            "loadbalancer",
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_session_data_roundtrip() {
        let session = SessionData::new("http://localhost:8081", "us-east");
        let encoded = serde_json::to_string(&session).unwrap();
        let decoded: SessionData = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, session);
    }

    #[test]
    fn test_json_field_names() {
        let session = SessionData::new("http://localhost:8081", "us-east");
        let encoded = serde_json::to_string(&session).unwrap();
        assert!(encoded.contains("\"backend_url\""));
        assert!(encoded.contains("\"region\""));
        assert!(encoded.contains("\"created_at\""));
        assert!(encoded.contains("\"last_access\""));
    }

    #[tokio::test]
    async fn test_set_and_get_session() {
        let mgr = manager();
        mgr.set_session("s1", "http://localhost:8081", "us-east")
            .await
            .unwrap();

        let session = mgr.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.backend_url, "http://localhost:8081");
        assert_eq!(session.region, "us-east");
    }

    #[tokio::test]
    async fn test_missing_session() {
        let mgr = manager();
        assert!(mgr.get_session("nope").await.unwrap().is_none());
        assert!(!mgr.session_exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_session() {
        let mgr = manager();
        mgr.set_session("s2", "http://localhost:8082", "")
            .await
            .unwrap();
        assert!(mgr.session_exists("s2").await.unwrap());

        mgr.delete_session("s2").await.unwrap();
        assert!(!mgr.session_exists("s2").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_refreshes_last_access() {
        let mgr = manager();
        mgr.set_session("s3", "http://localhost:8081", "us-east")
            .await
            .unwrap();

        let first = mgr.get_session("s3").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = mgr.get_session("s3").await.unwrap().unwrap();

        assert!(second.last_access > first.created_at);
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_key_layout() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let mgr = StickySessionManager::new(
            Arc::clone(&store),
            "loadbalancer",
            Duration::from_secs(3600),
        );
        mgr.set_session("abc123", "http://localhost:8081", "")
            .await
            .unwrap();

        assert!(store
            .exists("loadbalancer:session:abc123")
            .await
            .unwrap());
    }
}
