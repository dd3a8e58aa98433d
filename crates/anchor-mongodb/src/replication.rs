//! Change-stream replication.
//!
//! One watcher task per watched collection (or a single database-wide
//! watcher when no containers are named). Continuation tokens are the
//! change stream's resume tokens serialized as JSON; feeding one back
//! through `set_position` makes the next `start` open the stream with
//! `resume_after`, the driver's at-least-once resume.
//!
//! `replace` events cannot be distinguished into insert-vs-update, so they
//! surface as `Upsert` and consumers apply end-state.

use crate::bson_convert::document_to_row;
use crate::mongo::MongoHandle;
use anchor::adapter::{ConnState, ReplicationOperator};
use anchor::prelude::*;
use anchor::replication::Provenance;
use anchor::transform::transform_row;
use async_trait::async_trait;
use bson::Document;
use chrono::Utc;
use futures::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::FullDocumentType;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

pub const MECHANISM: &str = "change_stream";

pub(crate) struct MongoReplication {
    state: Arc<ConnState>,
    handle: Arc<MongoHandle>,
}

impl MongoReplication {
    pub(crate) fn new(state: Arc<ConnState>, handle: Arc<MongoHandle>) -> MongoReplication {
        MongoReplication { state, handle }
    }
}

#[async_trait]
impl ReplicationOperator for MongoReplication {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<String> {
        vec![MECHANISM.to_string()]
    }

    async fn check_prerequisites(&self) -> Result<()> {
        self.state.ensure_open()?;
        // Change streams need a replica set or sharded cluster.
        let hello = self
            .handle
            .db()
            .run_command(bson::doc! {"hello": 1})
            .await
            .map_err(|err| Error::query("hello", err))?;
        let is_replica = hello.get("setName").is_some()
            || hello.get_str("msg").map(|m| m == "isdbgrid").unwrap_or(false);
        if !is_replica {
            return Err(Error::InvalidConfiguration(
                "change streams require a replica set or mongos; standalone will not emit events"
                    .into(),
            ));
        }
        Ok(())
    }

    async fn connect(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>> {
        self.state.ensure_open()?;
        Ok(Arc::new(MongoSource::new(
            Arc::clone(&self.handle),
            config,
        )))
    }

    async fn status(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let mut status = BTreeMap::new();
        status.insert("mechanism".into(), Value::String(MECHANISM.into()));
        Ok(status)
    }

    async fn lag(&self) -> Result<ReplicationLag> {
        // The stream cursor exposes no distance metric.
        Ok(ReplicationLag::Unknown)
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(
            EngineType::MongoDb,
            "list_slots",
            "change streams have no slot objects",
        ))
    }

    async fn drop_slot(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::MongoDb,
            "drop_slot",
            "change streams have no slot objects",
        ))
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        Err(Error::unsupported(
            EngineType::MongoDb,
            "list_publications",
            "change streams have no publication objects",
        ))
    }

    async fn drop_publication(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported(
            EngineType::MongoDb,
            "drop_publication",
            "change streams have no publication objects",
        ))
    }

    fn parse_event(&self, raw: &[u8]) -> Result<CdcEvent> {
        let json: serde_json::Value = serde_json::from_slice(raw)?;
        let doc = bson::to_document(&json).map_err(|err| {
            Error::InvalidConfiguration(format!("change event is not a document: {err}"))
        })?;
        let operation = match doc.get_str("operationType").unwrap_or_default() {
            "insert" => CdcOperation::Create,
            "update" => CdcOperation::Update,
            "replace" => CdcOperation::Upsert,
            "delete" => CdcOperation::Delete,
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown change stream operation {other:?}"
                )))
            }
        };
        let container = doc
            .get_document("ns")
            .ok()
            .and_then(|ns| ns.get_str("coll").ok())
            .unwrap_or_default()
            .to_string();
        let fields = match operation {
            CdcOperation::Delete => doc
                .get_document("documentKey")
                .map(document_to_row)
                .unwrap_or_default(),
            _ => doc
                .get_document("fullDocument")
                .map(document_to_row)
                .unwrap_or_default(),
        };
        Ok(CdcEvent {
            operation,
            container,
            fields,
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            provenance: Provenance {
                engine: EngineType::MongoDb,
                mechanism: MECHANISM.to_string(),
            },
        })
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<u64> {
        self.state.ensure_open()?;
        let collection = self
            .handle
            .db()
            .collection::<Document>(&event.container);
        match event.operation {
            CdcOperation::Create => {
                collection
                    .insert_one(crate::bson_convert::row_to_document(&event.fields))
                    .await
                    .map_err(|err| Error::query("insert_one", err))?;
                Ok(1)
            }
            CdcOperation::Update | CdcOperation::Upsert => {
                let doc = crate::bson_convert::row_to_document(&event.fields);
                let filter = match doc.get("_id") {
                    Some(id) => bson::doc! {"_id": id.clone()},
                    None => {
                        collection
                            .insert_one(doc)
                            .await
                            .map_err(|err| Error::query("insert_one", err))?;
                        return Ok(1);
                    }
                };
                collection
                    .replace_one(filter, doc)
                    .upsert(true)
                    .await
                    .map_err(|err| Error::query("replace_one", err))?;
                Ok(1)
            }
            CdcOperation::Delete => {
                let result = collection
                    .delete_many(crate::bson_convert::row_to_document(&event.fields))
                    .await
                    .map_err(|err| Error::query("delete_many", err))?;
                Ok(result.deleted_count)
            }
        }
    }
}

/// A running change-stream source.
pub struct MongoSource {
    handle: Arc<MongoHandle>,
    config: ReplicationConfig,
    active: AtomicBool,
    status: RwLock<SourceStatus>,
    /// Latest resume token as JSON; last writer wins across watchers,
    /// consistent with undefined cross-container ordering.
    position: Arc<RwLock<String>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MongoSource {
    fn new(handle: Arc<MongoHandle>, config: ReplicationConfig) -> MongoSource {
        let position = config.start_position.clone().unwrap_or_default();
        let (shutdown, _) = watch::channel(false);
        MongoSource {
            handle,
            config,
            active: AtomicBool::new(false),
            status: RwLock::new(SourceStatus::Created),
            position: Arc::new(RwLock::new(position)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn resume_token(&self) -> Result<Option<ResumeToken>> {
        let raw = self.position.read().clone();
        if raw.is_empty() {
            return Ok(None);
        }
        let json: serde_json::Value = serde_json::from_str(&raw)?;
        let token: ResumeToken = serde_json::from_value(json).map_err(|err| {
            Error::InvalidConfiguration(format!("bad change stream resume token: {err}"))
        })?;
        Ok(Some(token))
    }

    fn spawn_watcher(
        &self,
        container: Option<String>,
        resume: Option<ResumeToken>,
    ) -> JoinHandle<()> {
        let handle = Arc::clone(&self.handle);
        let config = self.config.clone();
        let position = Arc::clone(&self.position);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let db = handle.db();
            let stream = match &container {
                Some(name) => {
                    let mut builder = db
                        .collection::<Document>(name)
                        .watch()
                        .full_document(FullDocumentType::UpdateLookup);
                    if let Some(token) = resume {
                        builder = builder.resume_after(token);
                    }
                    builder.await
                }
                None => {
                    let mut builder = db.watch().full_document(FullDocumentType::UpdateLookup);
                    if let Some(token) = resume {
                        builder = builder.resume_after(token);
                    }
                    builder.await
                }
            };
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, container = ?container, "failed to open change stream");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            let token = stream.resume_token();
                            if let Some(cdc) = normalize(&event) {
                                let mut cdc = cdc;
                                if !config.rules.is_empty() {
                                    match transform_row(
                                        &cdc.fields,
                                        &config.rules,
                                        config.transform_endpoint.as_deref(),
                                    )
                                    .await
                                    {
                                        Ok(fields) => cdc.fields = fields,
                                        Err(err) => warn!(error = %err, "transform failed, delivering original row"),
                                    }
                                }
                                (config.on_event)(cdc).await;
                            }
                            if let Some(token) = token {
                                if let Ok(json) = serde_json::to_string(&token) {
                                    *position.write() = json.clone();
                                    if let Some(checkpoint) = &config.on_checkpoint {
                                        checkpoint(json).await;
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, container = ?container, "change stream error");
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

fn normalize(event: &ChangeStreamEvent<Document>) -> Option<CdcEvent> {
    let operation = match event.operation_type {
        OperationType::Insert => CdcOperation::Create,
        OperationType::Update => CdcOperation::Update,
        OperationType::Replace => CdcOperation::Upsert,
        OperationType::Delete => CdcOperation::Delete,
        _ => return None,
    };
    let container = event
        .ns
        .as_ref()
        .and_then(|ns| ns.coll.clone())
        .unwrap_or_default();
    let fields = match operation {
        CdcOperation::Delete => event.document_key.as_ref().map(document_to_row),
        _ => event.full_document.as_ref().map(document_to_row),
    }
    .unwrap_or_default();
    Some(CdcEvent {
        operation,
        container,
        fields,
        timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        provenance: Provenance {
            engine: EngineType::MongoDb,
            mechanism: MECHANISM.to_string(),
        },
    })
}

#[async_trait]
impl ReplicationSource for MongoSource {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn status(&self) -> SourceStatus {
        *self.status.read()
    }

    fn metadata(&self) -> SourceMetadata {
        SourceMetadata {
            mechanism: MECHANISM.to_string(),
            resume_capable: true,
            operations: vec![
                CdcOperation::Create,
                CdcOperation::Update,
                CdcOperation::Delete,
                CdcOperation::Upsert,
            ],
            ordered_across_containers: false,
            extra: BTreeMap::new(),
        }
    }

    async fn start(&self) -> Result<()> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyExists(format!(
                "replication source {} already active",
                self.config.id
            )));
        }
        if *self.status.read() == SourceStatus::Stopped {
            self.active.store(false, Ordering::Release);
            return Err(Error::Fatal("source is stopped".into()));
        }
        let resume = self.resume_token()?;

        let mut tasks = self.tasks.lock();
        if self.config.containers.is_empty() {
            tasks.push(self.spawn_watcher(None, resume));
        } else {
            for container in &self.config.containers {
                tasks.push(self.spawn_watcher(Some(container.clone()), resume.clone()));
            }
        }
        drop(tasks);
        *self.status.write() = SourceStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        self.active.store(false, Ordering::Release);
        *self.status.write() = SourceStatus::Stopped;
        if !tasks.is_empty() {
            let _ = self.shutdown.send(true);
            for task in tasks {
                let _ = task.await;
            }
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<String> {
        Ok(self.position.read().clone())
    }

    async fn set_position(&self, token: &str) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(Error::InvalidConfiguration(
                "cannot reposition an active source".into(),
            ));
        }
        // Validate eagerly so a corrupt token fails here, not inside the
        // watcher task.
        let json: serde_json::Value = serde_json::from_str(token)?;
        let _: ResumeToken = serde_json::from_value(json).map_err(|err| {
            Error::InvalidConfiguration(format!("bad change stream resume token: {err}"))
        })?;
        *self.position.write() = token.to_string();
        Ok(())
    }
}
