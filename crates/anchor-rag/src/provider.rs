//! RAG providers.
//!
//! A provider turns a batch of documents into embeddings. Providers are
//! resolved per integration through a factory so one orchestrator can
//! serve integrations pointing at different endpoints or models.

use crate::integrations::Integration;
use crate::types::{Document, IngestResult};
use anchor::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait RagProvider: Send + Sync {
    /// Ingest one batch. Implementations return one result per input
    /// document in input order; a batch-level failure is surfaced as an
    /// `Err` and the pipeline synthesises per-document failures.
    async fn ingest(&self, documents: &[Document]) -> Result<Vec<IngestResult>>;
}

/// Resolves the provider for an integration.
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, integration: &Integration) -> Result<Arc<dyn RagProvider>>;
}

/// HTTP provider speaking the ingestion endpoint protocol:
/// POST `{documents: [...], model: "..."}` -> `{results: [...]}`.
pub struct HttpRagProvider {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    documents: &'a [Document],
    model: &'a str,
}

#[derive(Deserialize)]
struct IngestResponse {
    results: Vec<IngestResult>,
}

impl HttpRagProvider {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> HttpRagProvider {
        HttpRagProvider {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl RagProvider for HttpRagProvider {
    async fn ingest(&self, documents: &[Document]) -> Result<Vec<IngestResult>> {
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(Duration::from_secs(55))
            .json(&IngestRequest {
                documents,
                model: &self.model,
            })
            .send()
            .await
            .map_err(|err| Error::Transient(format!("rag provider unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "rag provider returned {}",
                response.status()
            )));
        }
        let body: IngestResponse = response
            .json()
            .await
            .map_err(|err| Error::Transient(format!("rag provider payload: {err}")))?;
        Ok(body.results)
    }
}

/// Default factory: one HTTP provider per integration endpoint/model.
#[derive(Default)]
pub struct HttpProviderFactory;

impl ProviderFactory for HttpProviderFactory {
    fn provider_for(&self, integration: &Integration) -> Result<Arc<dyn RagProvider>> {
        let endpoint = integration.provider_endpoint.as_deref().ok_or_else(|| {
            Error::InvalidConfiguration(format!(
                "integration {} has no provider endpoint",
                integration.id
            ))
        })?;
        Ok(Arc::new(HttpRagProvider::new(
            endpoint,
            integration.embedding_model.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn http_provider_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ingest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"document_id": "d1", "embeddings": [
                        {"model": "m", "vector": [0.1, 0.2], "content": "hello"}
                    ]},
                ]
            })))
            .mount(&server)
            .await;

        let provider = HttpRagProvider::new(format!("{}/ingest", server.uri()), "m");
        let docs = vec![Document {
            id: "d1".into(),
            content: "hello".into(),
            metadata: serde_json::Map::new(),
        }];
        let results = provider.ingest(&docs).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].embeddings[0].vector, vec![0.1, 0.2]);
        assert!(!results[0].is_failed());
    }

    #[tokio::test]
    async fn provider_errors_are_transient() {
        let provider = HttpRagProvider::new("http://127.0.0.1:1/ingest", "m");
        let err = provider.ingest(&[]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
