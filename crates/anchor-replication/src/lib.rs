//! # Anchor replication engine
//!
//! Owns the lifecycle of CDC sources across connections: creation through
//! the adapter's replication operator, checkpoint persistence through an
//! injected store, resume on restart, and clean shutdown.
//!
//! The engine never interprets continuation tokens - they are opaque to
//! everything but the mechanism that minted them. Delivery is
//! at-least-once from the last persisted token; consumers dedupe by key
//! where that matters.
//!
//! ## Example
//!
//! ```rust,ignore
//! use anchor_replication::{ReplicationEngine, MemoryCheckpointStore};
//! use std::sync::Arc;
//!
//! # async fn example(conn: Arc<anchor::adapter::Connection>) -> anchor::Result<()> {
//! let engine = ReplicationEngine::new(Arc::new(MemoryCheckpointStore::new()));
//! let source_id = engine
//!     .attach(&conn, anchor_replication::SourceSpec {
//!         id: "src_orders".into(),
//!         containers: vec!["orders".into()],
//!         ..Default::default()
//!     }, anchor::replication::event_callback(|event| async move {
//!         println!("{} {}", event.operation, event.container);
//!     }))
//!     .await?;
//! engine.stop(&source_id).await?;
//! # Ok(())
//! # }
//! ```

mod engine;
mod store;

pub use engine::{ReplicationEngine, SourceSpec};
pub use store::{CheckpointStore, MemoryCheckpointStore};
