//! # Anchor RAG pipeline orchestrator
//!
//! Moves documents from an Anchor-managed source into embedding rows in
//! an Anchor-managed target through a bounded extract -> process -> store
//! pipeline:
//!
//! - **Extract** streams the source table in order (default batch 100)
//!   and wraps each row as a [`types::Document`] with a standard metadata
//!   envelope
//! - **Process** fans batches across a worker pool (default 4) calling
//!   the integration's [`provider::RagProvider`] with a per-batch
//!   deadline; a provider failure synthesises one failed result per
//!   document so every id is accounted for
//! - **Store** buffers embedding rows and flushes them into the target
//!   collection on batch-full and on close
//!
//! Three execution modes share the pipeline: synchronous (returns
//! tallies), asynchronous (returns a `job_` id tracked by
//! [`jobs::JobTracker`]), and streaming (emits [`types::Progress`] over a
//! channel that closes on completion). Cancellation lets in-flight
//! batches finish and starts nothing new.

pub mod integrations;
pub mod jobs;
pub mod pipeline;
pub mod provider;
pub mod types;

pub use integrations::{Integration, IntegrationRepository, IntegrationStore, MemoryIntegrationRepository};
pub use jobs::JobTracker;
pub use pipeline::RagOrchestrator;
pub use provider::{HttpProviderFactory, HttpRagProvider, ProviderFactory, RagProvider};
pub use types::{
    Document, Embedding, IngestResult, JobStatus, PipelineCounters, PipelineJob, PipelineRequest,
    ProcessingOptions, Progress, SourceSpec, Stage, TargetSpec,
};
