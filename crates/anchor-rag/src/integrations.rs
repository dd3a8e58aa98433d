//! Integration registry.
//!
//! An integration binds a source database, a target collection, and a
//! provider configuration under a stable `integration_` id. The in-memory
//! map is the working set; durability goes through the injected
//! repository, which is the only state (besides replication checkpoints)
//! that survives a restart.

use anchor::ids::{new_id, INTEGRATION_PREFIX};
use anchor::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub workspace_id: String,
    /// Ingestion endpoint of the provider serving this integration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_endpoint: Option<String>,
    #[serde(default = "default_model")]
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_model() -> String {
    "text-embedding-3-small".into()
}

/// Durable home for integrations; injected at construction.
#[async_trait]
pub trait IntegrationRepository: Send + Sync {
    async fn persist(&self, integration: &Integration) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<Integration>>;
}

/// Repository that forgets on restart; fine for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryIntegrationRepository {
    items: RwLock<HashMap<String, Integration>>,
}

impl MemoryIntegrationRepository {
    pub fn new() -> MemoryIntegrationRepository {
        MemoryIntegrationRepository::default()
    }
}

#[async_trait]
impl IntegrationRepository for MemoryIntegrationRepository {
    async fn persist(&self, integration: &Integration) -> Result<()> {
        self.items
            .write()
            .insert(integration.id.clone(), integration.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.items.write().remove(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Integration>> {
        Ok(self.items.read().values().cloned().collect())
    }
}

/// Working-set store. Get paths take the read lock, mutations take the
/// write lock and then persist outside it.
pub struct IntegrationStore {
    repository: Arc<dyn IntegrationRepository>,
    items: RwLock<HashMap<String, Integration>>,
}

impl IntegrationStore {
    pub fn new(repository: Arc<dyn IntegrationRepository>) -> IntegrationStore {
        IntegrationStore {
            repository,
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Load the persisted set into the working map; called once at start.
    pub async fn hydrate(&self) -> Result<usize> {
        let loaded = self.repository.load_all().await?;
        let mut items = self.items.write();
        for integration in loaded {
            items.insert(integration.id.clone(), integration);
        }
        Ok(items.len())
    }

    pub async fn create(
        &self,
        name: impl Into<String>,
        provider_endpoint: Option<String>,
        embedding_model: Option<String>,
    ) -> Result<Integration> {
        let now = Utc::now();
        let integration = Integration {
            id: new_id(INTEGRATION_PREFIX),
            name: name.into(),
            tenant_id: String::new(),
            workspace_id: String::new(),
            provider_endpoint,
            embedding_model: embedding_model.unwrap_or_else(default_model),
            created_at: now,
            updated_at: now,
        };
        if self
            .items
            .read()
            .values()
            .any(|existing| existing.name == integration.name)
        {
            return Err(Error::AlreadyExists(format!(
                "integration named {:?}",
                integration.name
            )));
        }
        self.items
            .write()
            .insert(integration.id.clone(), integration.clone());
        self.repository.persist(&integration).await?;
        Ok(integration)
    }

    /// Accepts an `integration_` id or a name, mirroring the boundary
    /// layer's resolution rule.
    pub fn resolve(&self, id_or_name: &str) -> Result<Integration> {
        let items = self.items.read();
        if anchor::ids::is_id(id_or_name) {
            return items
                .get(id_or_name)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("integration {id_or_name}")));
        }
        items
            .values()
            .find(|integration| integration.name == id_or_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("integration named {id_or_name:?}")))
    }

    pub fn list(&self) -> Vec<Integration> {
        let mut all: Vec<Integration> = self.items.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.items.write().remove(id).is_none() {
            return Err(Error::NotFound(format!("integration {id}")));
        }
        self.repository.remove(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_resolve_by_id_and_name() {
        let store = IntegrationStore::new(Arc::new(MemoryIntegrationRepository::new()));
        let created = store
            .create("orders-rag", Some("http://provider/ingest".into()), None)
            .await
            .unwrap();
        assert!(created.id.starts_with("integration_"));

        assert_eq!(store.resolve(&created.id).unwrap().id, created.id);
        assert_eq!(store.resolve("orders-rag").unwrap().id, created.id);
        assert!(store.resolve("missing").is_err());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = IntegrationStore::new(Arc::new(MemoryIntegrationRepository::new()));
        store.create("dup", None, None).await.unwrap();
        assert!(matches!(
            store.create("dup", None, None).await.unwrap_err(),
            Error::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn hydrate_restores_persisted_set() {
        let repository = Arc::new(MemoryIntegrationRepository::new());
        {
            let store = IntegrationStore::new(Arc::clone(&repository) as Arc<dyn IntegrationRepository>);
            store.create("persisted", None, None).await.unwrap();
        }
        let fresh = IntegrationStore::new(repository);
        assert_eq!(fresh.hydrate().await.unwrap(), 1);
        assert!(fresh.resolve("persisted").is_ok());
    }
}
