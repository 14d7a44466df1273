//! Live tunnel sessions, indexed by subdomain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use burrow_core::Multiplexer;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One registered tunnel. Owns the multiplexer handle for its carrier.
pub struct Session {
    /// Unique routing key.
    pub subdomain: String,
    pub public_url: String,
    pub mux: Multiplexer,
    pub connected_at: Instant,
}

/// Registry of live sessions. Lives for the gateway's lifetime.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.subdomain.clone(), session.clone());
        info!(subdomain = %session.subdomain, public_url = %session.public_url, "session registered");
    }

    pub async fn remove(&self, subdomain: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(subdomain);
        if removed.is_some() {
            debug!(subdomain = %subdomain, "session removed");
        }
        removed
    }

    pub async fn get(&self, subdomain: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(subdomain).cloned()
    }

    pub async fn contains(&self, subdomain: &str) -> bool {
        self.sessions.read().await.contains_key(subdomain)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove and return every session (gateway shutdown).
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        sessions.drain().map(|(_, s)| s).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(subdomain: &str) -> Arc<Session> {
        let (carrier, _peer) = tokio::io::duplex(4096);
        Arc::new(Session {
            subdomain: subdomain.to_string(),
            public_url: format!("http://{subdomain}.test.local"),
            mux: Multiplexer::server(carrier),
            connected_at: Instant::now(),
        })
    }

    #[tokio::test]
    async fn insert_get_remove() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.count().await, 0);

        registry.insert(test_session("abcd1234")).await;
        assert_eq!(registry.count().await, 1);
        assert!(registry.contains("abcd1234").await);

        let session = registry.get("abcd1234").await.unwrap();
        assert_eq!(session.public_url, "http://abcd1234.test.local");

        assert!(registry.remove("abcd1234").await.is_some());
        assert!(registry.get("abcd1234").await.is_none());
        assert!(registry.remove("abcd1234").await.is_none());
    }

    #[tokio::test]
    async fn insert_replaces_same_subdomain() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("abcd1234")).await;
        registry.insert(test_session("abcd1234")).await;
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn drain_empties_the_registry() {
        let registry = SessionRegistry::new();
        registry.insert(test_session("aaaa0000")).await;
        registry.insert(test_session("bbbb1111")).await;

        let drained = registry.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count().await, 0);
    }
}
