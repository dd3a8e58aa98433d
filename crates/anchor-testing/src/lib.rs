// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! # Anchor testing utilities
//!
//! An in-memory engine implementing the complete adapter contract, used by
//! coordinator crates to exercise registry, pipeline, and replication
//! invariants without a live back-end:
//!
//! - **MemoryAdapter**: full operator surface over a shared store; can
//!   masquerade as any engine tag, with an append-only variant that refuses
//!   updates and deletes the way columnar stores do
//! - **MemoryStore**: the shared table/event-log state, cloneable so tests
//!   can mutate data "externally" while a source is watching
//! - **MemorySource**: replication over the store's change log with real
//!   checkpoint/resume semantics
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use anchor_testing::MemoryAdapter;
//!
//! let adapter = MemoryAdapter::new();
//! let store = adapter.store();
//! // connect through anchor::registry::ConnectionRegistry as usual
//! ```

mod adapter;
mod replication;
mod store;

pub use adapter::MemoryAdapter;
pub use replication::{MemoryReplication, MemorySource};
pub use store::{MemoryStore, MECHANISM};

#[cfg(test)]
mod tests {
    use super::*;
    use anchor::prelude::*;
    use anchor::replication::{checkpoint_callback, event_callback};
    use std::sync::Arc;
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

    fn row(id: i64, name: &str) -> Row {
        Row::from([
            ("id".to_string(), Value::Int(id)),
            ("name".to_string(), Value::String(name.into())),
        ])
    }

    #[tokio::test]
    async fn adapter_round_trip() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect(config("db_rt")).await.unwrap();

        // Empty database discovers an empty model.
        let model = conn.schema().unwrap().discover_schema().await.unwrap();
        assert!(model.tables.is_empty());

        // Create one table and rediscover it.
        let mut wanted = UnifiedModel::new("testdb");
        wanted.add_table(
            Table::new("t")
                .with_column(Column::new("id", UnifiedDataType::Bigint).primary_key())
                .with_column(Column::new("name", UnifiedDataType::String)),
        );
        conn.schema().unwrap().create_structure(&wanted).await.unwrap();
        let model = conn.schema().unwrap().discover_schema().await.unwrap();
        assert_eq!(model.tables.len(), 1);
        assert_eq!(model.tables["t"].primary_key_columns(), vec!["id"]);

        // create_structure(discover_schema()) is a no-op.
        conn.schema().unwrap().create_structure(&model).await.unwrap();
        assert_eq!(
            conn.schema().unwrap().discover_schema().await.unwrap(),
            model
        );

        let data = conn.data().unwrap();
        let affected = data.insert("t", &[row(1, "a"), row(2, "b")]).await.unwrap();
        assert_eq!(affected, 2);

        let rows = data.fetch("t", 10).await.unwrap();
        assert_eq!(rows, vec![row(1, "a"), row(2, "b")]);

        assert_eq!(data.get_row_count("t", None).await.unwrap(), (2, true));
    }

    #[tokio::test]
    async fn stream_totals_match_row_count() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect(config("db_stream")).await.unwrap();
        let data = conn.data().unwrap();

        let rows: Vec<Row> = (0..23).map(|i| row(i, "x")).collect();
        data.insert("t", &rows).await.unwrap();

        let mut collected = 0usize;
        let mut params = StreamParams::new("t", 5);
        loop {
            let page = data.stream(&params).await.unwrap();
            collected += page.rows.len();
            if !page.has_more {
                break;
            }
            params = params.after(page.next_cursor);
        }
        let (count, exact) = data.get_row_count("t", None).await.unwrap();
        assert!(exact);
        assert_eq!(collected as i64, count);
    }

    #[tokio::test]
    async fn empty_write_batches_are_no_ops() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect(config("db_empty")).await.unwrap();
        let data = conn.data().unwrap();
        data.insert("t", &[row(1, "a")]).await.unwrap();

        assert_eq!(data.insert("t", &[]).await.unwrap(), 0);
        assert_eq!(data.update("t", &[], &["id".into()]).await.unwrap(), 0);
        assert_eq!(data.upsert("t", &[], &["id".into()]).await.unwrap(), 0);
        assert_eq!(data.delete("t", &Row::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_updates_existing_and_inserts_new() {
        let adapter = MemoryAdapter::new();
        let conn = adapter.connect(config("db_upsert")).await.unwrap();
        let data = conn.data().unwrap();
        data.insert("t", &[row(1, "a")]).await.unwrap();

        let affected = data
            .upsert("t", &[row(1, "a2"), row(3, "c")], &["id".into()])
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let rows = data.fetch("t", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row(1, "a2"));
        assert_eq!(rows[1], row(3, "c"));
    }

    #[tokio::test]
    async fn append_only_gates_update_and_delete() {
        let adapter = MemoryAdapter::append_only();
        let conn = adapter.connect(config("db_ap")).await.unwrap();
        let data = conn.data().unwrap();

        assert_eq!(data.insert("t", &[row(1, "a")]).await.unwrap(), 1);

        let err = data.update("t", &[row(1, "b")], &["id".into()]).await.unwrap_err();
        match err {
            Error::Unsupported { engine, reason, .. } => {
                assert_eq!(engine, EngineType::ClickHouse);
                assert!(!reason.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }

        let conditions = Row::from([("id".to_string(), Value::Int(1))]);
        let err = data.delete("t", &conditions).await.unwrap_err();
        match err {
            Error::Unsupported { reason, .. } => assert!(reason.contains("retention")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn replication_delivers_in_insertion_order() {
        let adapter = MemoryAdapter::new();
        let store = adapter.store();
        let conn = adapter.connect(config("db_cdc")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let source = conn
            .replication()
            .unwrap()
            .connect(ReplicationConfig {
                id: "src_1".into(),
                database_id: "db_cdc".into(),
                containers: vec!["t".into()],
                slot_name: None,
                publication_name: None,
                start_position: None,
                rules: Vec::new(),
                transform_endpoint: None,
                on_event: event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
                on_checkpoint: None,
            })
            .await
            .unwrap();

        source.start().await.unwrap();
        assert!(source.start().await.is_err(), "double start must fail");

        store.insert_rows("t", vec![row(1, "a"), row(2, "b"), row(3, "c")]);
        store.insert_rows("other", vec![row(9, "zz")]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.operation, CdcOperation::Create);
            assert_eq!(event.container, "t");
            seen.push(event.fields.get("id").cloned().unwrap());
        }
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);

        source.stop().await.unwrap();
        source.stop().await.unwrap(); // idempotent
        assert_eq!(source.status(), SourceStatus::Stopped);
    }

    #[tokio::test]
    async fn replication_resumes_from_checkpoint_at_least_once() {
        let adapter = MemoryAdapter::new();
        let store = adapter.store();
        let conn = adapter.connect(config("db_resume")).await.unwrap();
        let replication = conn.replication().unwrap();

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (ckpt_tx, mut ckpt_rx) = mpsc::unbounded_channel();
        let make_config = |start: Option<String>, tx: mpsc::UnboundedSender<CdcEvent>| {
            ReplicationConfig {
                id: "src_resume".into(),
                database_id: "db_resume".into(),
                containers: vec!["t".into()],
                slot_name: None,
                publication_name: None,
                start_position: start,
                rules: Vec::new(),
                transform_endpoint: None,
                on_event: event_callback(move |event| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(event);
                    }
                }),
                on_checkpoint: Some(checkpoint_callback({
                    let ckpt_tx = ckpt_tx.clone();
                    move |token| {
                        let ckpt_tx = ckpt_tx.clone();
                        async move {
                            let _ = ckpt_tx.send(token);
                        }
                    }
                })),
            }
        };

        let source = replication
            .connect(make_config(None, event_tx.clone()))
            .await
            .unwrap();
        source.start().await.unwrap();

        store.insert_rows("t", vec![row(1, "a"), row(2, "b"), row(3, "c")]);
        for _ in 0..3 {
            event_rx.recv().await.unwrap();
        }
        // Checkpoint observed after the second event.
        let _first = ckpt_rx.recv().await.unwrap();
        let second = ckpt_rx.recv().await.unwrap();
        source.stop().await.unwrap();

        // Fresh source resumed from the saved token sees at least row 3.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let resumed = replication
            .connect(make_config(Some(second.clone()), tx2))
            .await
            .unwrap();
        assert!(resumed.metadata().resume_capable);
        resumed.set_position(&second).await.unwrap();
        resumed.start().await.unwrap();

        let event = rx2.recv().await.unwrap();
        assert_eq!(event.fields.get("id"), Some(&Value::Int(3)));
        resumed.stop().await.unwrap();
    }

    #[tokio::test]
    async fn instance_connection_manages_databases() {
        let adapter = MemoryAdapter::new();
        let instance = adapter
            .connect_instance(InstanceConfig {
                id: "inst_1".into(),
                engine: EngineType::Postgres,
                host: "localhost".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let ops = instance.instance().unwrap();
        ops.create_database("app").await.unwrap();
        assert!(ops.create_database("app").await.is_err());
        assert_eq!(ops.list_databases().await.unwrap(), vec!["app".to_string()]);
        ops.drop_database("app").await.unwrap();
        assert!(ops.drop_database("app").await.is_err());

        instance.close().await.unwrap();
        assert!(instance.instance().is_err());
    }
}
