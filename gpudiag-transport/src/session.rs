//! HTTP session bookkeeping: the handshake assigns a session id, echoed on
//! every subsequent `POST /mcp` request via the `Mcp-Session-Id` header.
//! Guarded by a single `RwLock`, one lock per shared resource.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub client_name: Option<String>,
    pub client_version: Option<String>,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, client_name: Option<String>, client_version: Option<String>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(
            id.clone(),
            SessionRecord {
                client_name,
                client_version,
            },
        );
        id
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Drop a session's bookkeeping, e.g. when its connection closes.
    pub async fn remove(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn created_session_is_findable_and_removable() {
        let store = SessionStore::new();
        let id = store.create(Some("gpudiag-cli".to_string()), Some("0.1.0".to_string())).await;
        assert!(store.contains(&id).await);
        store.remove(&id).await;
        assert!(!store.contains(&id).await);
    }

    #[tokio::test]
    async fn unknown_session_id_is_absent() {
        let store = SessionStore::new();
        assert!(!store.contains("not-a-real-session").await);
    }
}
