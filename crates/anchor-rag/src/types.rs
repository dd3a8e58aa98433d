//! RAG payloads and pipeline configuration.

use anchor::value::Row;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of ingestable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One embedding produced for (a fragment of) a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub model: String,
    pub vector: Vec<f32>,
    /// The content fragment this vector represents.
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of ingesting one document. `error` is non-empty exactly when
/// the document failed; a failed document carries no embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResult {
    pub document_id: String,
    #[serde(default)]
    pub embeddings: Vec<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResult {
    pub fn failed(document_id: impl Into<String>, error: impl Into<String>) -> IngestResult {
        IngestResult {
            document_id: document_id.into(),
            embeddings: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Where documents come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub database_id: String,
    /// Table to stream, or an engine-native query for pass-through
    /// extraction.
    pub table: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    100
}

/// Where embeddings go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub database_id: String,
    /// Target table/collection for embedding rows.
    pub collection: String,
}

/// Tunables for the process/store stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-batch provider timeout.
    #[serde(default = "default_batch_timeout", with = "duration_secs")]
    pub batch_timeout: Duration,
    /// Rows buffered before a store flush.
    #[serde(default = "default_batch_size")]
    pub store_batch_size: usize,
}

fn default_workers() -> usize {
    4
}

fn default_batch_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        ProcessingOptions {
            workers: default_workers(),
            batch_timeout: default_batch_timeout(),
            store_batch_size: default_batch_size(),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// One pipeline execution request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub integration_id: String,
    pub source: SourceSpec,
    pub target: TargetSpec,
    #[serde(default)]
    pub options: ProcessingOptions,
}

/// Final tallies. The invariant `processed == succeeded + failed` holds
/// per run; `stored_embeddings` counts rows written to the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub processed: u64,
    pub stored_embeddings: u64,
    pub failed: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Pipeline job state for async execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Stage labels surfaced in progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Process,
    Store,
    Done,
}

/// A tracked execution of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: String,
    pub integration_id: String,
    pub status: JobStatus,
    pub progress: Progress,
    pub request: PipelineRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PipelineCounters>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time pipeline progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub embeddings_stored: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

/// Turn one source row into a document with the standard metadata
/// envelope.
pub fn document_from_row(row: &Row, database_id: &str, query: &str) -> Document {
    let id = row
        .get("id")
        .or_else(|| row.get("_id"))
        .or_else(|| row.get("_key"))
        .map(|v| v.to_parameter_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let mut metadata = serde_json::Map::new();
    metadata.insert(
        "source_database_id".into(),
        serde_json::Value::String(database_id.to_string()),
    );
    metadata.insert("query".into(), serde_json::Value::String(query.to_string()));
    metadata.insert(
        "fetched_at".into(),
        serde_json::Value::String(Utc::now().to_rfc3339()),
    );
    Document {
        id,
        content: anchor::value::row_to_json(row).to_string(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor::value::Value;

    #[test]
    fn documents_inherit_row_ids() {
        let row = Row::from([("id".to_string(), Value::Int(42))]);
        let doc = document_from_row(&row, "db_src", "SELECT *");
        assert_eq!(doc.id, "42");
        assert_eq!(
            doc.metadata.get("source_database_id"),
            Some(&serde_json::Value::String("db_src".into()))
        );
        assert!(doc.metadata.contains_key("fetched_at"));
    }

    #[test]
    fn rows_without_ids_get_generated_ones() {
        let a = document_from_row(&Row::new(), "db", "q");
        let b = document_from_row(&Row::new(), "db", "q");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn failed_results_carry_no_embeddings() {
        let result = IngestResult::failed("doc_1", "provider unreachable");
        assert!(result.is_failed());
        assert!(result.embeddings.is_empty());
    }

    #[test]
    fn request_defaults_apply() {
        let json = serde_json::json!({
            "integration_id": "integration_x",
            "source": {"database_id": "db_a", "table": "t"},
            "target": {"database_id": "db_b", "collection": "embeddings"},
        });
        let request: PipelineRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.source.batch_size, 100);
        assert_eq!(request.options.workers, 4);
        assert_eq!(request.options.batch_timeout.as_secs(), 60);
    }
}
