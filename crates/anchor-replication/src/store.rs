//! Checkpoint persistence.
//!
//! The engine writes every token it sees through a [`CheckpointStore`];
//! which backing store that is (database row, object key, file) is the
//! caller's concern and injected at construction. Only the latest token
//! per source matters.

use anchor::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Durable home for the latest continuation token of each source.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, source_id: &str, token: &str) -> Result<()>;

    async fn load(&self, source_id: &str) -> Result<Option<String>>;

    async fn clear(&self, source_id: &str) -> Result<()>;
}

/// Process-local store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> MemoryCheckpointStore {
        MemoryCheckpointStore::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, source_id: &str, token: &str) -> Result<()> {
        self.tokens
            .write()
            .insert(source_id.to_string(), token.to_string());
        Ok(())
    }

    async fn load(&self, source_id: &str) -> Result<Option<String>> {
        Ok(self.tokens.read().get(source_id).cloned())
    }

    async fn clear(&self, source_id: &str) -> Result<()> {
        self.tokens.write().remove(source_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_token_wins() {
        let store = MemoryCheckpointStore::new();
        store.save("src_1", "10").await.unwrap();
        store.save("src_1", "20").await.unwrap();
        assert_eq!(store.load("src_1").await.unwrap().as_deref(), Some("20"));
        store.clear("src_1").await.unwrap();
        assert_eq!(store.load("src_1").await.unwrap(), None);
    }
}
