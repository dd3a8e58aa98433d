//! Change-data-capture types shared by adapters and the replication engine.
//!
//! A [`ReplicationSource`] owns its background tasks and its continuation
//! token. Callers observe the token through `get_position`, persist it
//! outside the process, and hand it back through `set_position` on a fresh
//! source to resume. The checkpoint callback is the only outbound mutation
//! channel; delivery from a resumed token is at-least-once.

use crate::capability::EngineType;
use crate::error::Result;
use crate::value::Row;
use crate::transform::TransformRule;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Normalized change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdcOperation {
    Create,
    Update,
    Delete,
    /// Emitted by mechanisms that cannot distinguish insert from update
    /// (change feeds); consumers apply end-state.
    Upsert,
}

impl fmt::Display for CdcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            CdcOperation::Create => "create",
            CdcOperation::Update => "update",
            CdcOperation::Delete => "delete",
            CdcOperation::Upsert => "upsert",
        };
        f.write_str(tag)
    }
}

/// Where an event came from: engine tag plus mechanism name
/// (`wal`, `change_stream`, `keyspace_notification`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub engine: EngineType,
    pub mechanism: String,
}

/// A normalized change record.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcEvent {
    pub operation: CdcOperation,
    /// Table / collection / index the change applies to.
    pub container: String,
    /// Row or document as a field-keyed map. For deletes this carries the
    /// key columns the mechanism exposes.
    pub fields: Row,
    /// Unix nanoseconds at capture.
    pub timestamp_ns: i64,
    pub provenance: Provenance,
}

/// Async event callback. Runs on the replication source's task; must not
/// block indefinitely.
pub type EventCallback = Arc<dyn Fn(CdcEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked with the continuation token after each durable point.
pub type CheckpointCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into an [`EventCallback`].
pub fn event_callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(CdcEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Wrap an async closure into a [`CheckpointCallback`].
pub fn checkpoint_callback<F, Fut>(f: F) -> CheckpointCallback
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |token| Box::pin(f(token)))
}

/// Per-source CDC parameters.
#[derive(Clone)]
pub struct ReplicationConfig {
    /// Stable identifier for the source.
    pub id: String,
    /// Connection id of the watched database.
    pub database_id: String,
    /// Watched containers: tables, collections, indices, key patterns or
    /// stream names depending on the mechanism.
    pub containers: Vec<String>,
    /// WAL slot name, when the mechanism uses slots.
    pub slot_name: Option<String>,
    /// Publication name, when the mechanism uses publications.
    pub publication_name: Option<String>,
    /// Resume token to start from; `None` means "from now".
    pub start_position: Option<String>,
    /// Transformation rules applied to each event row before delivery.
    pub rules: Vec<TransformRule>,
    /// External transformation service; consulted when `rules` is non-empty.
    pub transform_endpoint: Option<String>,
    pub on_event: EventCallback,
    pub on_checkpoint: Option<CheckpointCallback>,
}

impl fmt::Debug for ReplicationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationConfig")
            .field("id", &self.id)
            .field("database_id", &self.database_id)
            .field("containers", &self.containers)
            .field("slot_name", &self.slot_name)
            .field("publication_name", &self.publication_name)
            .field("start_position", &self.start_position)
            .field("rules", &self.rules.len())
            .field("transform_endpoint", &self.transform_endpoint)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a replication source. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Created,
    Active,
    Stopped,
    Failed,
}

/// Static facts a source declares about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub mechanism: String,
    /// Whether `set_position` on a fresh source resumes from a saved token.
    pub resume_capable: bool,
    /// Operations the mechanism can emit.
    pub operations: Vec<CdcOperation>,
    /// Whether event order is preserved across containers within this
    /// source. Always false in this implementation; some WAL mechanisms
    /// could guarantee it, this one does not promise it.
    pub ordered_across_containers: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// Best-effort replication lag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationLag {
    /// Byte or LSN distance for WAL-style engines.
    Bytes(u64),
    /// Time distance for change feeds.
    Millis(u64),
    Unknown,
}

/// A running CDC source. Owns its background tasks; `stop` guarantees task
/// exit before returning and is idempotent.
#[async_trait::async_trait]
pub trait ReplicationSource: Send + Sync {
    fn id(&self) -> &str;

    fn status(&self) -> SourceStatus;

    fn metadata(&self) -> SourceMetadata;

    /// Begin emitting events. Fails with `AlreadyExists` semantics if the
    /// source is already active (atomic 0 -> 1 transition).
    async fn start(&self) -> Result<()>;

    /// Signal background tasks and block until every task has returned.
    async fn stop(&self) -> Result<()>;

    /// Current continuation token. After a successful start the token, fed
    /// to `set_position` on a fresh source with the same config, resumes
    /// from exactly that point per the mechanism (at-least-once).
    async fn get_position(&self) -> Result<String>;

    /// Install a saved token before `start`.
    async fn set_position(&self, token: &str) -> Result<()>;

    /// Equivalent to `stop`; idempotent.
    async fn close(&self) -> Result<()> {
        match self.stop().await {
            Ok(()) => Ok(()),
            Err(crate::Error::ConnectionClosed) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_tags_are_stable() {
        assert_eq!(CdcOperation::Upsert.to_string(), "upsert");
        let json = serde_json::to_string(&CdcOperation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");
    }

    #[tokio::test]
    async fn event_callback_wrapper_invokes_closure() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let cb = event_callback(move |event: CdcEvent| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(event.container);
            }
        });
        let event = CdcEvent {
            operation: CdcOperation::Create,
            container: "t".into(),
            fields: Row::new(),
            timestamp_ns: 0,
            provenance: Provenance {
                engine: EngineType::Postgres,
                mechanism: "wal".into(),
            },
        };
        cb(event).await;
        assert_eq!(rx.recv().await.as_deref(), Some("t"));
    }
}
