//! Conversation persistence.
//!
//! When enabled, the pipeline appends each exchange (the last inbound
//! message and the generated reply) to a keyed, append-only log. The store
//! sits off the response path: a failed append is logged and the response
//! is still returned.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::Result;
use crate::types::Message;

/// Keyed append-only message log.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// All messages for `id`, oldest first. Unknown ids yield an empty log.
    async fn get(&self, id: &str) -> Result<Vec<Message>>;

    async fn append(&self, id: &str, message: Message) -> Result<()>;

    async fn clear(&self, id: &str) -> Result<()>;
}

/// In-process [`SessionStore`], bounded per conversation.
#[derive(Debug)]
pub struct MemorySessionStore {
    max_messages: usize,
    sessions: Mutex<HashMap<String, Vec<Message>>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(200)
    }
}

impl MemorySessionStore {
    /// Keep at most `max_messages` per conversation; older ones are dropped.
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &str) -> Result<Vec<Message>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(id).cloned().unwrap_or_default())
    }

    async fn append(&self, id: &str, message: Message) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let log = sessions.entry(id.to_string()).or_default();
        log.push(message);
        if log.len() > self.max_messages {
            let excess = log.len() - self.max_messages;
            log.drain(..excess);
        }
        Ok(())
    }

    async fn clear(&self, id: &str) -> Result<()> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_get_clear() {
        let store = MemorySessionStore::default();
        store.append("t1", Message::user("hi")).await.unwrap();
        store.append("t1", Message::assistant("hello")).await.unwrap();

        let log = store.get("t1").await.unwrap();
        assert_eq!(log, vec![Message::user("hi"), Message::assistant("hello")]);
        assert!(store.get("other").await.unwrap().is_empty());

        store.clear("t1").await.unwrap();
        assert!(store.get("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oldest_messages_dropped_past_limit() {
        let store = MemorySessionStore::new(2);
        for text in ["a", "b", "c"] {
            store.append("t", Message::user(text)).await.unwrap();
        }
        let log = store.get("t").await.unwrap();
        assert_eq!(log, vec![Message::user("b"), Message::user("c")]);
    }
}
