//! The extract -> process -> store pipeline.
//!
//! Bounded channels throughout: the extractor blocks on a full channel,
//! workers block on the store stage, and the store stage writes batches
//! to the target connection. Worker reordering across batches is
//! acceptable because embedding rows are keyed by document id.

use crate::integrations::IntegrationStore;
use crate::jobs::JobTracker;
use crate::provider::{ProviderFactory, RagProvider};
use crate::types::{
    document_from_row, Document, IngestResult, PipelineCounters, PipelineRequest, Progress, Stage,
};
use anchor::adapter::{Connection, StreamParams};
use anchor::prelude::*;
use anchor::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Bounded batches in flight between stages.
const CHANNEL_BATCHES: usize = 4;

/// Orchestrates pipeline executions in three modes: synchronous,
/// job-tracked asynchronous, and progress-streaming.
pub struct RagOrchestrator {
    integrations: Arc<IntegrationStore>,
    factory: Arc<dyn ProviderFactory>,
    jobs: Arc<JobTracker>,
}

impl RagOrchestrator {
    pub fn new(
        integrations: Arc<IntegrationStore>,
        factory: Arc<dyn ProviderFactory>,
    ) -> RagOrchestrator {
        RagOrchestrator {
            integrations,
            factory,
            jobs: Arc::new(JobTracker::new()),
        }
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    fn provider_for(&self, integration_id: &str) -> Result<Arc<dyn RagProvider>> {
        let integration = self.integrations.resolve(integration_id)?;
        self.factory.provider_for(&integration)
    }

    /// Run to completion and return the tallies.
    pub async fn execute(
        &self,
        source: Arc<Connection>,
        target: Arc<Connection>,
        request: PipelineRequest,
    ) -> Result<PipelineCounters> {
        let provider = self.provider_for(&request.integration_id)?;
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        run_pipeline(source, target, request, provider, None, cancel_rx).await
    }

    /// Enqueue a job and return its id immediately; terminal status lands
    /// on the tracker.
    pub fn execute_async(
        &self,
        source: Arc<Connection>,
        target: Arc<Connection>,
        request: PipelineRequest,
    ) -> Result<String> {
        let provider = self.provider_for(&request.integration_id)?;
        let (job_id, cancel_rx) = self.jobs.register(request.clone());
        let jobs = Arc::clone(&self.jobs);
        let job_for_task = job_id.clone();
        tokio::spawn(async move {
            jobs.mark_running(&job_for_task);
            let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(CHANNEL_BATCHES);
            let pipeline = run_pipeline(
                source,
                target,
                request,
                provider,
                Some(progress_tx),
                cancel_rx,
            );
            tokio::pin!(pipeline);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut pipeline => break outcome,
                    Some(progress) = progress_rx.recv() => {
                        jobs.update_progress(&job_for_task, progress);
                    }
                }
            };
            match outcome {
                Ok(counters) => {
                    info!(job = %job_for_task, processed = counters.processed, "pipeline job completed");
                    jobs.complete(&job_for_task, counters);
                }
                Err(err) => {
                    warn!(job = %job_for_task, error = %err, "pipeline job failed");
                    jobs.fail(&job_for_task, &err);
                }
            }
        });
        Ok(job_id)
    }

    /// Run in the background, emitting progress updates; the channel
    /// closes on completion.
    pub fn execute_streaming(
        &self,
        source: Arc<Connection>,
        target: Arc<Connection>,
        request: PipelineRequest,
    ) -> Result<mpsc::Receiver<Progress>> {
        let provider = self.provider_for(&request.integration_id)?;
        let (progress_tx, progress_rx) = mpsc::channel(CHANNEL_BATCHES);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(err) =
                run_pipeline(source, target, request, provider, Some(progress_tx), cancel_rx).await
            {
                warn!(error = %err, "streaming pipeline failed");
            }
        });
        Ok(progress_rx)
    }

    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.jobs.cancel(job_id)
    }
}

/// One pipeline run. `processed` counts every document that reached the
/// process stage, `failed` the subset whose ingestion failed; stored
/// embeddings count rows written to the target.
pub(crate) async fn run_pipeline(
    source: Arc<Connection>,
    target: Arc<Connection>,
    request: PipelineRequest,
    provider: Arc<dyn RagProvider>,
    progress: Option<mpsc::Sender<Progress>>,
    cancel: watch::Receiver<bool>,
) -> Result<PipelineCounters> {
    let (doc_tx, doc_rx) = mpsc::channel::<Vec<Document>>(CHANNEL_BATCHES);
    let (result_tx, mut result_rx) = mpsc::channel::<Vec<IngestResult>>(CHANNEL_BATCHES);

    // Extract: stream the source in order, one Documents batch per page.
    let extract = {
        let source = Arc::clone(&source);
        let spec = request.source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let data = source.data()?;
            let mut params = StreamParams::new(&spec.table, spec.batch_size);
            loop {
                if *cancel.borrow() {
                    debug!(table = %spec.table, "extract cancelled");
                    break;
                }
                let page = data.stream(&params).await?;
                let next = page.next_cursor.clone();
                let has_more = page.has_more;
                if !page.rows.is_empty() {
                    let documents: Vec<Document> = page
                        .rows
                        .iter()
                        .map(|row| document_from_row(row, source.id(), &spec.table))
                        .collect();
                    if doc_tx.send(documents).await.is_err() {
                        break; // downstream gone
                    }
                }
                if !has_more {
                    break;
                }
                params = params.after(next);
            }
            Ok::<(), Error>(())
        })
    };

    // Process: a worker pool pulls batches and ingests with a deadline.
    let doc_rx = Arc::new(Mutex::new(doc_rx));
    let workers: Vec<_> = (0..request.options.workers.max(1))
        .map(|worker| {
            let doc_rx = Arc::clone(&doc_rx);
            let result_tx = result_tx.clone();
            let provider = Arc::clone(&provider);
            let cancel = cancel.clone();
            let timeout = request.options.batch_timeout;
            tokio::spawn(async move {
                loop {
                    if *cancel.borrow() {
                        break;
                    }
                    let batch = { doc_rx.lock().await.recv().await };
                    let Some(batch) = batch else { break };
                    let results =
                        match tokio::time::timeout(timeout, provider.ingest(&batch)).await {
                            Ok(Ok(results)) => align_results(&batch, results),
                            Ok(Err(err)) => {
                                warn!(worker, error = %err, "ingest batch failed");
                                batch
                                    .iter()
                                    .map(|doc| IngestResult::failed(&doc.id, err.to_string()))
                                    .collect()
                            }
                            Err(_) => {
                                warn!(worker, "ingest batch timed out");
                                batch
                                    .iter()
                                    .map(|doc| IngestResult::failed(&doc.id, "ingest timed out"))
                                    .collect()
                            }
                        };
                    if result_tx.send(results).await.is_err() {
                        break;
                    }
                }
            })
        })
        .collect();
    drop(result_tx);

    // Store: buffer embedding rows and flush on batch-full and close.
    let data = target.data()?;
    let mut counters = PipelineCounters::default();
    let mut buffer: Vec<Row> = Vec::with_capacity(request.options.store_batch_size);
    while let Some(results) = result_rx.recv().await {
        for result in results {
            counters.processed += 1;
            if result.is_failed() {
                counters.failed += 1;
                if let Some(error) = &result.error {
                    if counters.errors.len() < 32 {
                        counters
                            .errors
                            .push(format!("{}: {error}", result.document_id));
                    }
                }
                continue;
            }
            for embedding in &result.embeddings {
                buffer.push(embedding_row(&result.document_id, embedding));
                if buffer.len() >= request.options.store_batch_size {
                    counters.stored_embeddings +=
                        data.insert(&request.target.collection, &buffer).await?;
                    buffer.clear();
                }
            }
        }
        if let Some(progress) = &progress {
            let _ = progress
                .send(Progress {
                    documents_processed: counters.processed,
                    documents_failed: counters.failed,
                    embeddings_stored: counters.stored_embeddings,
                    stage: Some(Stage::Process),
                })
                .await;
        }
    }
    if !buffer.is_empty() {
        counters.stored_embeddings += data.insert(&request.target.collection, &buffer).await?;
    }

    for worker in workers {
        let _ = worker.await;
    }
    match extract.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(join_err) => return Err(Error::Fatal(format!("extract task panicked: {join_err}"))),
    }

    if let Some(progress) = &progress {
        let _ = progress
            .send(Progress {
                documents_processed: counters.processed,
                documents_failed: counters.failed,
                embeddings_stored: counters.stored_embeddings,
                stage: Some(Stage::Done),
            })
            .await;
    }
    Ok(counters)
}

/// Per-document failures must stay aligned with their ids even when the
/// provider returns fewer results than documents.
fn align_results(batch: &[Document], results: Vec<IngestResult>) -> Vec<IngestResult> {
    if results.len() == batch.len() {
        return results;
    }
    warn!(
        expected = batch.len(),
        got = results.len(),
        "provider result count mismatch, padding failures"
    );
    let mut by_id: BTreeMap<String, IngestResult> = results
        .into_iter()
        .map(|result| (result.document_id.clone(), result))
        .collect();
    batch
        .iter()
        .map(|doc| {
            by_id
                .remove(&doc.id)
                .unwrap_or_else(|| IngestResult::failed(&doc.id, "no result from provider"))
        })
        .collect()
}

fn embedding_row(document_id: &str, embedding: &crate::types::Embedding) -> Row {
    let mut payload = BTreeMap::new();
    payload.insert(
        "model".to_string(),
        Value::String(embedding.model.clone()),
    );
    payload.insert(
        "vector".to_string(),
        Value::List(
            embedding
                .vector
                .iter()
                .map(|f| Value::Float(f64::from(*f)))
                .collect(),
        ),
    );
    payload.insert(
        "content".to_string(),
        Value::String(embedding.content.clone()),
    );

    let mut row = Row::new();
    row.insert("document_id".into(), Value::String(document_id.to_string()));
    row.insert("embedding".into(), Value::Map(payload));
    row.insert(
        "metadata".into(),
        Value::from_json(serde_json::Value::Object(embedding.metadata.clone())),
    );
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{IntegrationStore, MemoryIntegrationRepository};
    use crate::provider::ProviderFactory;
    use crate::types::{JobStatus, ProcessingOptions, SourceSpec, TargetSpec};
    use anchor::adapter::Adapter as _;
    use anchor_testing::MemoryAdapter;
    use async_trait::async_trait;

    /// Provider producing `embeddings_per_doc` embeddings per document and
    /// failing any batch containing an id in the failure range.
    struct ScriptedProvider {
        embeddings_per_doc: usize,
        fail_ids: std::ops::Range<i64>,
    }

    #[async_trait]
    impl RagProvider for ScriptedProvider {
        async fn ingest(&self, documents: &[Document]) -> Result<Vec<IngestResult>> {
            let poisoned = documents.iter().any(|doc| {
                doc.id
                    .parse::<i64>()
                    .map(|id| self.fail_ids.contains(&id))
                    .unwrap_or(false)
            });
            if poisoned {
                return Err(Error::Transient("provider exploded on this batch".into()));
            }
            Ok(documents
                .iter()
                .map(|doc| IngestResult {
                    document_id: doc.id.clone(),
                    embeddings: (0..self.embeddings_per_doc)
                        .map(|i| crate::types::Embedding {
                            model: "scripted".into(),
                            vector: vec![i as f32, 0.5],
                            content: doc.content.clone(),
                            metadata: serde_json::Map::new(),
                        })
                        .collect(),
                    error: None,
                })
                .collect())
        }
    }

    struct ScriptedFactory {
        provider: Arc<dyn RagProvider>,
    }

    impl ProviderFactory for ScriptedFactory {
        fn provider_for(
            &self,
            _integration: &crate::integrations::Integration,
        ) -> Result<Arc<dyn RagProvider>> {
            Ok(Arc::clone(&self.provider))
        }
    }

    fn conn_config(id: &str) -> ConnectionConfig {
        ConnectionConfig {
            id: id.into(),
            engine: EngineType::Postgres,
            host: "localhost".into(),
            database: "testdb".into(),
            ..Default::default()
        }
    }

    async fn seed_source(adapter: &MemoryAdapter, rows: i64) -> Arc<Connection> {
        let conn = Arc::new(adapter.connect(conn_config("db_src")).await.unwrap());
        let data: Vec<Row> = (0..rows)
            .map(|i| {
                Row::from([
                    ("id".to_string(), Value::Int(i)),
                    ("body".to_string(), Value::String(format!("row {i}"))),
                ])
            })
            .collect();
        conn.data().unwrap().insert("t", &data).await.unwrap();
        conn
    }

    async fn orchestrator(provider: Arc<dyn RagProvider>) -> (RagOrchestrator, String) {
        let integrations = Arc::new(IntegrationStore::new(Arc::new(
            MemoryIntegrationRepository::new(),
        )));
        let integration = integrations
            .create("test-rag", Some("http://unused/ingest".into()), None)
            .await
            .unwrap();
        (
            RagOrchestrator::new(integrations, Arc::new(ScriptedFactory { provider })),
            integration.id,
        )
    }

    fn request(integration_id: &str) -> PipelineRequest {
        PipelineRequest {
            integration_id: integration_id.into(),
            source: SourceSpec {
                database_id: "db_src".into(),
                table: "t".into(),
                batch_size: 100,
            },
            target: TargetSpec {
                database_id: "db_tgt".into(),
                collection: "embeddings".into(),
            },
            options: ProcessingOptions::default(),
        }
    }

    #[tokio::test]
    async fn sync_pipeline_counts_every_document() {
        let source_adapter = MemoryAdapter::new();
        let source = seed_source(&source_adapter, 250).await;
        let target_adapter = MemoryAdapter::new();
        let target = Arc::new(target_adapter.connect(conn_config("db_tgt")).await.unwrap());

        let (orchestrator, integration_id) = orchestrator(Arc::new(ScriptedProvider {
            embeddings_per_doc: 2,
            fail_ids: 0..0,
        }))
        .await;

        let counters = orchestrator
            .execute(Arc::clone(&source), Arc::clone(&target), request(&integration_id))
            .await
            .unwrap();
        assert_eq!(counters.processed, 250);
        assert_eq!(counters.failed, 0);
        assert_eq!(counters.stored_embeddings, 500);

        let (stored, exact) = target
            .data()
            .unwrap()
            .get_row_count("embeddings", None)
            .await
            .unwrap();
        assert!(exact);
        assert_eq!(stored, 500);
    }

    #[tokio::test]
    async fn failed_batches_preserve_document_ids() {
        let source_adapter = MemoryAdapter::new();
        let source = seed_source(&source_adapter, 250).await;
        let target_adapter = MemoryAdapter::new();
        let target = Arc::new(target_adapter.connect(conn_config("db_tgt")).await.unwrap());

        // Ids 100..200 form exactly the second extract batch.
        let (orchestrator, integration_id) = orchestrator(Arc::new(ScriptedProvider {
            embeddings_per_doc: 2,
            fail_ids: 100..200,
        }))
        .await;

        let counters = orchestrator
            .execute(Arc::clone(&source), Arc::clone(&target), request(&integration_id))
            .await
            .unwrap();
        assert_eq!(counters.processed, 250);
        assert_eq!(counters.failed, 100);
        assert_eq!(counters.stored_embeddings, 300);
        // Failure messages name the failed documents.
        assert!(counters.errors.iter().all(|e| !e.is_empty()));
    }

    #[tokio::test]
    async fn async_pipeline_tracks_job_state() {
        let source_adapter = MemoryAdapter::new();
        let source = seed_source(&source_adapter, 30).await;
        let target_adapter = MemoryAdapter::new();
        let target = Arc::new(target_adapter.connect(conn_config("db_tgt")).await.unwrap());

        let (orchestrator, integration_id) = orchestrator(Arc::new(ScriptedProvider {
            embeddings_per_doc: 1,
            fail_ids: 0..0,
        }))
        .await;

        let job_id = orchestrator
            .execute_async(source, target, request(&integration_id))
            .unwrap();
        assert!(job_id.starts_with("job_"));

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let job = orchestrator.jobs().get(&job_id).unwrap();
            if job.status == JobStatus::Completed {
                let result = job.result.unwrap();
                assert_eq!(result.processed, 30);
                assert_eq!(result.stored_embeddings, 30);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn streaming_pipeline_emits_progress_and_closes() {
        let source_adapter = MemoryAdapter::new();
        let source = seed_source(&source_adapter, 120).await;
        let target_adapter = MemoryAdapter::new();
        let target = Arc::new(target_adapter.connect(conn_config("db_tgt")).await.unwrap());

        let (orchestrator, integration_id) = orchestrator(Arc::new(ScriptedProvider {
            embeddings_per_doc: 1,
            fail_ids: 0..0,
        }))
        .await;

        let mut progress = orchestrator
            .execute_streaming(source, target, request(&integration_id))
            .unwrap();
        let mut last = Progress::default();
        while let Some(update) = progress.recv().await {
            assert!(update.documents_processed >= last.documents_processed);
            last = update;
        }
        assert_eq!(last.documents_processed, 120);
        assert_eq!(last.stage, Some(Stage::Done));
    }

    #[tokio::test]
    async fn unknown_integration_fails_fast() {
        let source_adapter = MemoryAdapter::new();
        let source = Arc::new(source_adapter.connect(conn_config("db_src")).await.unwrap());
        let target = Arc::new(MemoryAdapter::new().connect(conn_config("db_tgt")).await.unwrap());

        let (orchestrator, _) = orchestrator(Arc::new(ScriptedProvider {
            embeddings_per_doc: 1,
            fail_ids: 0..0,
        }))
        .await;

        let err = orchestrator
            .execute(source, target, request("integration_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
