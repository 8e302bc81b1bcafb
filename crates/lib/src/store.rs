//! Conversation session store: local routing key -> remote conversation id.
//!
//! Sessions are created lazily by the handler on the first message for a key
//! and never expire in the in-memory implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Binding between a local routing key (e.g. `channel_id:user_id`, chosen by
/// the adapter) and the conversation id issued by the remote backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub conv_key: String,
    pub conversation_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store for sessions. Thread-safe for concurrent callers.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, conv_key: &str) -> Result<Option<Session>, StoreError>;
    async fn put(&self, conv_key: &str, session: Session) -> Result<(), StoreError>;
}

/// In-memory store behind a single mutex. No eviction. When two handlers
/// share one store and race on the same key, the last `put` wins and the
/// earlier conversation id is silently overwritten.
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn get(&self, conv_key: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.lock().await.get(conv_key).cloned())
    }

    async fn put(&self, conv_key: &str, session: Session) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .await
            .insert(conv_key.to_string(), session);
        Ok(())
    }
}
