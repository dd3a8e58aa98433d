//! Source lifecycle management.

use crate::store::CheckpointStore;
use anchor::adapter::Connection;
use anchor::prelude::*;
use anchor::replication::{CheckpointCallback, EventCallback};
use anchor::transform::TransformRule;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Declarative description of one source; the engine fills in callbacks
/// and the persisted start position.
#[derive(Debug, Clone, Default)]
pub struct SourceSpec {
    /// Stable source identifier; also the checkpoint key.
    pub id: String,
    /// Watched containers; empty watches everything the mechanism covers.
    pub containers: Vec<String>,
    pub slot_name: Option<String>,
    pub publication_name: Option<String>,
    pub rules: Vec<TransformRule>,
    pub transform_endpoint: Option<String>,
}

/// Coordinator for every running CDC source in the process.
pub struct ReplicationEngine {
    store: Arc<dyn CheckpointStore>,
    sources: RwLock<HashMap<String, Arc<dyn ReplicationSource>>>,
}

impl ReplicationEngine {
    pub fn new(store: Arc<dyn CheckpointStore>) -> ReplicationEngine {
        ReplicationEngine {
            store,
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Create, resume, and start a source on a connection.
    ///
    /// The engine persists every checkpoint token under the spec id; when
    /// a token is already stored and the mechanism is resume-capable, the
    /// fresh source is positioned there before starting, which is the
    /// at-least-once restart path.
    pub async fn attach(
        &self,
        connection: &Connection,
        spec: SourceSpec,
        on_event: EventCallback,
    ) -> Result<String> {
        if spec.id.is_empty() {
            return Err(Error::InvalidConfiguration(
                "source spec needs an id".into(),
            ));
        }
        if self.sources.read().contains_key(&spec.id) {
            return Err(Error::AlreadyExists(format!("replication source {}", spec.id)));
        }

        let operator = connection.replication()?;
        if !operator.is_supported() {
            // Surface the adapter's own reason.
            operator.check_prerequisites().await?;
            return Err(Error::unsupported(
                connection.engine(),
                "replication",
                "engine reports no mechanism",
            ));
        }
        operator.check_prerequisites().await?;

        let saved = self.store.load(&spec.id).await?;
        let on_checkpoint: CheckpointCallback = {
            let store = Arc::clone(&self.store);
            let source_id = spec.id.clone();
            Arc::new(move |token: String| {
                let store = Arc::clone(&store);
                let source_id = source_id.clone();
                Box::pin(async move {
                    if let Err(err) = store.save(&source_id, &token).await {
                        warn!(source = %source_id, error = %err, "checkpoint persist failed");
                    }
                })
            })
        };

        let config = ReplicationConfig {
            id: spec.id.clone(),
            database_id: connection.id().to_string(),
            containers: spec.containers,
            slot_name: spec.slot_name,
            publication_name: spec.publication_name,
            start_position: saved.clone(),
            rules: spec.rules,
            transform_endpoint: spec.transform_endpoint,
            on_event,
            on_checkpoint: Some(on_checkpoint),
        };
        let source = operator.connect(config).await?;

        if let Some(token) = saved {
            if source.metadata().resume_capable {
                source.set_position(&token).await?;
                info!(source = %spec.id, "resuming from persisted checkpoint");
            } else {
                warn!(source = %spec.id, "mechanism cannot resume, starting from now");
            }
        }
        source.start().await?;

        self.sources
            .write()
            .insert(spec.id.clone(), Arc::clone(&source));
        info!(source = %spec.id, database = %connection.id(), "replication source started");
        Ok(spec.id)
    }

    pub fn get(&self, source_id: &str) -> Result<Arc<dyn ReplicationSource>> {
        self.sources
            .read()
            .get(source_id)
            .map(Arc::clone)
            .ok_or_else(|| Error::NotFound(format!("replication source {source_id}")))
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.read().keys().cloned().collect()
    }

    /// Current continuation token of a running source, straight from the
    /// mechanism rather than the store.
    pub async fn position(&self, source_id: &str) -> Result<String> {
        self.get(source_id)?.get_position().await
    }

    /// Stop one source and remove it; the persisted checkpoint is kept so
    /// a later attach resumes.
    pub async fn stop(&self, source_id: &str) -> Result<()> {
        let source = self
            .sources
            .write()
            .remove(source_id)
            .ok_or_else(|| Error::NotFound(format!("replication source {source_id}")))?;
        source.stop().await?;
        info!(source = %source_id, "replication source stopped");
        Ok(())
    }

    /// Stop one source and drop its checkpoint; the next attach starts
    /// from now.
    pub async fn detach(&self, source_id: &str) -> Result<()> {
        self.stop(source_id).await?;
        self.store.clear(source_id).await
    }

    /// Graceful shutdown; every stop error is logged, none aborts the rest.
    pub async fn stop_all(&self) {
        let sources: Vec<(String, Arc<dyn ReplicationSource>)> =
            self.sources.write().drain().collect();
        for (id, source) in sources {
            if let Err(err) = source.stop().await {
                warn!(source = %id, error = %err, "error stopping replication source");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCheckpointStore;
    use anchor::adapter::Adapter as _;
    use anchor::replication::event_callback;
    use anchor_testing::MemoryAdapter;
    use tokio::sync::mpsc;

    fn config(id: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: id.into(),
            engine: EngineType::Postgres,
            host: "localhost".into(),
            database: "testdb".into(),
            ..Default::default()
        }
    }

    fn row(id: i64) -> Row {
        Row::from([("id".to_string(), Value::Int(id))])
    }

    fn spec(id: &str) -> SourceSpec {
        SourceSpec {
            id: id.into(),
            containers: vec!["t".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn attach_streams_and_persists_checkpoints() {
        let adapter = MemoryAdapter::new();
        let store_backend = adapter.store();
        let conn = adapter.connect(config("db_r1")).await.unwrap();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let engine = ReplicationEngine::new(Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>);

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .attach(
                &conn,
                spec("src_1"),
                event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
            )
            .await
            .unwrap();

        store_backend.insert_rows("t", vec![row(1), row(2)]);
        assert_eq!(rx.recv().await.unwrap().fields.get("id"), Some(&Value::Int(1)));
        assert_eq!(rx.recv().await.unwrap().fields.get("id"), Some(&Value::Int(2)));

        // The checkpoint callback runs on the source task after each
        // delivery; wait for the second token to land in the store.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if checkpoints.load("src_1").await.unwrap().as_deref() == Some("2") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "checkpoint never persisted");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(engine.position("src_1").await.unwrap(), "2");

        engine.stop("src_1").await.unwrap();
    }

    #[tokio::test]
    async fn restart_resumes_from_persisted_token() {
        let adapter = MemoryAdapter::new();
        let store_backend = adapter.store();
        let conn = adapter.connect(config("db_r2")).await.unwrap();
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let engine = ReplicationEngine::new(Arc::clone(&checkpoints));

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .attach(
                &conn,
                spec("src_2"),
                event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
            )
            .await
            .unwrap();
        store_backend.insert_rows("t", vec![row(1), row(2), row(3)]);
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        engine.stop("src_2").await.unwrap();

        // Rows written while no source is attached.
        store_backend.insert_rows("t", vec![row(4)]);

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        engine
            .attach(
                &conn,
                spec("src_2"),
                event_callback(move |event| {
                    let tx2 = tx2.clone();
                    async move {
                        let _ = tx2.send(event);
                    }
                }),
            )
            .await
            .unwrap();

        // At-least-once: the first event after resume is row 4 (nothing
        // earlier was lost, nothing earlier than the checkpoint replays).
        let event = rx2.recv().await.unwrap();
        assert_eq!(event.fields.get("id"), Some(&Value::Int(4)));
        engine.stop("src_2").await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_source_ids_are_rejected() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect(config("db_r3")).await.unwrap();
        let engine = ReplicationEngine::new(Arc::new(MemoryCheckpointStore::new()));

        engine
            .attach(&conn, spec("src_3"), event_callback(|_| async {}))
            .await
            .unwrap();
        let err = engine
            .attach(&conn, spec("src_3"), event_callback(|_| async {}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        engine.stop_all().await;
    }

    #[tokio::test]
    async fn detach_clears_the_checkpoint() {
        let adapter = MemoryAdapter::new();
        let store_backend = adapter.store();
        let conn = adapter.connect(config("db_r4")).await.unwrap();
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let engine = ReplicationEngine::new(Arc::clone(&checkpoints) as Arc<dyn CheckpointStore>);

        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .attach(
                &conn,
                spec("src_4"),
                event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
            )
            .await
            .unwrap();
        store_backend.insert_rows("t", vec![row(1)]);
        rx.recv().await.unwrap();

        engine.detach("src_4").await.unwrap();
        assert_eq!(checkpoints.load("src_4").await.unwrap(), None);
        assert!(matches!(
            engine.get("src_4").unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
