//! Logical replication over a `test_decoding` slot.
//!
//! The source polls `pg_logical_slot_get_changes` on a dedicated session;
//! each poll consumes changes and advances the slot's confirmed LSN, which
//! is exactly the at-least-once contract: a crash between delivery and the
//! external checkpoint replays from the confirmed LSN. Continuation tokens
//! are LSNs; `set_position` maps to `pg_replication_slot_advance`.

use crate::postgres::PgHandle;
use crate::sql::{build_delete, build_insert, build_update, param_refs, params_for, quote_ident};
use anchor::adapter::{ConnState, ReplicationOperator};
use anchor::prelude::*;
use anchor::replication::Provenance;
use anchor::transform::transform_row;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Mechanism tag in source metadata and event provenance.
pub const MECHANISM: &str = "wal_logical";

const DEFAULT_SLOT_PREFIX: &str = "anchor_slot_";
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POLL_BATCH: i32 = 500;

pub(crate) struct PostgresReplication {
    state: Arc<ConnState>,
    handle: Arc<PgHandle>,
    credentials: Credentials,
    tls: TlsOptions,
}

impl PostgresReplication {
    pub(crate) fn new(
        state: Arc<ConnState>,
        handle: Arc<PgHandle>,
        credentials: Credentials,
        tls: TlsOptions,
    ) -> PostgresReplication {
        PostgresReplication {
            state,
            handle,
            credentials,
            tls,
        }
    }

    async fn ensure_slot(&self, slot: &str) -> Result<()> {
        let exists = self
            .handle
            .query(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await?;
        if exists.is_empty() {
            self.handle
                .query(
                    "SELECT pg_create_logical_replication_slot($1, 'test_decoding')",
                    &[&slot],
                )
                .await?;
            debug!(slot, "created logical replication slot");
        }
        Ok(())
    }
}

#[async_trait]
impl ReplicationOperator for PostgresReplication {
    fn is_supported(&self) -> bool {
        true
    }

    fn supported_mechanisms(&self) -> Vec<String> {
        vec![MECHANISM.to_string()]
    }

    async fn check_prerequisites(&self) -> Result<()> {
        self.state.ensure_open()?;
        let rows = self.handle.query("SHOW wal_level", &[]).await?;
        let wal_level: String = rows
            .first()
            .and_then(|r| r.try_get(0).ok())
            .unwrap_or_default();
        if wal_level != "logical" {
            return Err(Error::InvalidConfiguration(format!(
                "wal_level is {wal_level:?}, logical decoding needs wal_level=logical"
            )));
        }
        let rows = self
            .handle
            .query(
                "SELECT rolreplication OR rolsuper FROM pg_roles WHERE rolname = current_user",
                &[],
            )
            .await?;
        let can_replicate: bool = rows.first().and_then(|r| r.try_get(0).ok()).unwrap_or(false);
        if !can_replicate {
            return Err(Error::InvalidConfiguration(
                "current role lacks REPLICATION privilege".into(),
            ));
        }
        Ok(())
    }

    async fn connect(&self, config: ReplicationConfig) -> Result<Arc<dyn ReplicationSource>> {
        self.state.ensure_open()?;
        let slot = config
            .slot_name
            .clone()
            .unwrap_or_else(|| format!("{DEFAULT_SLOT_PREFIX}{}", config.id));
        self.ensure_slot(&slot).await?;

        // Polling holds a session for the source's lifetime; give it a
        // dedicated connection so data operations never queue behind it.
        let session = PgHandle::open(
            &self.handle.host,
            self.handle.port,
            &self.handle.database,
            &self.credentials,
            &self.tls,
        )
        .await?;

        if let Some(position) = &config.start_position {
            advance_slot(&session, &slot, position).await?;
        }

        Ok(Arc::new(PostgresReplicationSource::new(config, slot, session)))
    }

    async fn status(&self) -> Result<BTreeMap<String, Value>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query(
                "SELECT slot_name, active, COALESCE(confirmed_flush_lsn::text, '') \
                 FROM pg_replication_slots WHERE plugin = 'test_decoding'",
                &[],
            )
            .await?;
        let mut status = BTreeMap::new();
        status.insert("mechanism".into(), Value::String(MECHANISM.into()));
        for row in rows {
            let name: String = row.try_get(0).unwrap_or_default();
            let active: bool = row.try_get(1).unwrap_or(false);
            let lsn: String = row.try_get(2).unwrap_or_default();
            status.insert(
                format!("slot.{name}"),
                Value::String(format!("active={active} confirmed={lsn}")),
            );
        }
        Ok(status)
    }

    async fn lag(&self) -> Result<ReplicationLag> {
        self.state.ensure_open()?;
        let lag = self
            .handle
            .query_scalar(
                "SELECT COALESCE(MAX(pg_wal_lsn_diff(pg_current_wal_lsn(), confirmed_flush_lsn)), 0)::bigint \
                 FROM pg_replication_slots WHERE plugin = 'test_decoding'",
            )
            .await?;
        Ok(ReplicationLag::Bytes(lag.max(0) as u64))
    }

    async fn list_slots(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query("SELECT slot_name FROM pg_replication_slots ORDER BY slot_name", &[])
            .await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn drop_slot(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        self.handle
            .query("SELECT pg_drop_replication_slot($1)", &[&name])
            .await
            .map(|_| ())
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        let rows = self
            .handle
            .query("SELECT pubname FROM pg_publication ORDER BY pubname", &[])
            .await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn drop_publication(&self, name: &str) -> Result<()> {
        self.state.ensure_open()?;
        let sql = format!("DROP PUBLICATION IF EXISTS {}", quote_ident(name));
        self.handle.execute(&sql, &[]).await.map(|_| ())
    }

    fn parse_event(&self, raw: &[u8]) -> Result<CdcEvent> {
        let line = std::str::from_utf8(raw)
            .map_err(|err| Error::InvalidConfiguration(format!("non-utf8 wal event: {err}")))?;
        parse_test_decoding(line)
            .ok_or_else(|| Error::InvalidConfiguration(format!("unparseable wal event: {line:?}")))
    }

    async fn apply_cdc_event(&self, event: &CdcEvent) -> Result<u64> {
        self.state.ensure_open()?;
        match event.operation {
            CdcOperation::Create => {
                let columns: Vec<String> = event.fields.keys().cloned().collect();
                if columns.is_empty() {
                    return Ok(0);
                }
                let sql = build_insert(&event.container, &columns, 1);
                let values: Vec<Value> = columns
                    .iter()
                    .map(|c| event.fields.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                let params = params_for(&values);
                self.handle.execute(&sql, &param_refs(&params)).await
            }
            CdcOperation::Update | CdcOperation::Upsert => {
                // End-state apply keyed on `id` when present; otherwise the
                // event degrades to an insert.
                if event.fields.contains_key("id") {
                    let set_columns: Vec<String> = event
                        .fields
                        .keys()
                        .filter(|k| k.as_str() != "id")
                        .cloned()
                        .collect();
                    let mut values: Vec<Value> = set_columns
                        .iter()
                        .map(|c| event.fields.get(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    values.push(event.fields.get("id").cloned().unwrap_or(Value::Null));
                    let sql = build_update(&event.container, &set_columns, &["id".into()]);
                    let params = params_for(&values);
                    self.handle.execute(&sql, &param_refs(&params)).await
                } else {
                    let columns: Vec<String> = event.fields.keys().cloned().collect();
                    let sql = build_insert(&event.container, &columns, 1);
                    let values: Vec<Value> = columns
                        .iter()
                        .map(|c| event.fields.get(c).cloned().unwrap_or(Value::Null))
                        .collect();
                    let params = params_for(&values);
                    self.handle.execute(&sql, &param_refs(&params)).await
                }
            }
            CdcOperation::Delete => {
                if event.fields.is_empty() {
                    return Ok(0);
                }
                let columns: Vec<String> = event.fields.keys().cloned().collect();
                let values: Vec<Value> = columns
                    .iter()
                    .map(|c| event.fields.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                let sql = build_delete(&event.container, &columns);
                let params = params_for(&values);
                self.handle.execute(&sql, &param_refs(&params)).await
            }
        }
    }
}

async fn advance_slot(handle: &PgHandle, slot: &str, lsn: &str) -> Result<()> {
    handle
        .query(
            "SELECT pg_replication_slot_advance($1, $2::pg_lsn)",
            &[&slot, &lsn],
        )
        .await
        .map(|_| ())
}

/// A running WAL source bound to one slot.
pub struct PostgresReplicationSource {
    config: ReplicationConfig,
    slot: String,
    session: Arc<PgHandle>,
    active: AtomicBool,
    status: RwLock<SourceStatus>,
    position: Arc<RwLock<String>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PostgresReplicationSource {
    fn new(
        config: ReplicationConfig,
        slot: String,
        session: Arc<PgHandle>,
    ) -> PostgresReplicationSource {
        let position = config.start_position.clone().unwrap_or_default();
        let (shutdown, _) = watch::channel(false);
        PostgresReplicationSource {
            config,
            slot,
            session,
            active: AtomicBool::new(false),
            status: RwLock::new(SourceStatus::Created),
            position: Arc::new(RwLock::new(position)),
            shutdown,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ReplicationSource for PostgresReplicationSource {
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
            ],
            ordered_across_containers: false,
            extra: BTreeMap::from([("slot".to_string(), self.slot.clone())]),
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

        let config = self.config.clone();
        let slot = self.slot.clone();
        let session = Arc::clone(&self.session);
        let position = Arc::clone(&self.position);
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = poll_once(&session, &slot, &config, &position).await {
                            if err.is_transient() {
                                warn!(slot = %slot, error = %err, "wal poll failed, backing off");
                            } else {
                                warn!(slot = %slot, error = %err, "wal poll failed");
                            }
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
        *self.status.write() = SourceStatus::Active;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let handle = self.task.lock().take();
        self.active.store(false, Ordering::Release);
        *self.status.write() = SourceStatus::Stopped;
        if let Some(handle) = handle {
            let _ = self.shutdown.send(true);
            let _ = handle.await;
        }
        Ok(())
    }

    async fn get_position(&self) -> Result<String> {
        let cached = self.position.read().clone();
        if !cached.is_empty() {
            return Ok(cached);
        }
        // Nothing consumed yet; the slot's confirmed LSN is the position.
        let rows = self
            .session
            .query(
                "SELECT COALESCE(confirmed_flush_lsn::text, '0/0') \
                 FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot],
            )
            .await?;
        rows.first()
            .and_then(|r| r.try_get(0).ok())
            .ok_or_else(|| Error::NotFound(format!("slot {}", self.slot)))
    }

    async fn set_position(&self, token: &str) -> Result<()> {
        if self.active.load(Ordering::Acquire) {
            return Err(Error::InvalidConfiguration(
                "cannot reposition an active source".into(),
            ));
        }
        advance_slot(&self.session, &self.slot, token).await?;
        *self.position.write() = token.to_string();
        Ok(())
    }
}

async fn poll_once(
    session: &PgHandle,
    slot: &str,
    config: &ReplicationConfig,
    position: &RwLock<String>,
) -> Result<()> {
    let rows = session
        .query(
            "SELECT lsn::text, data FROM pg_logical_slot_get_changes($1, NULL, $2)",
            &[&slot, &POLL_BATCH],
        )
        .await?;
    if rows.is_empty() {
        return Ok(());
    }

    let mut last_lsn = String::new();
    for row in &rows {
        let lsn: String = row.try_get(0).unwrap_or_default();
        let data: String = row.try_get(1).unwrap_or_default();
        last_lsn = lsn;
        let Some(mut event) = parse_test_decoding(&data) else {
            continue; // BEGIN/COMMIT markers and unknown decorations
        };
        if !config.containers.is_empty() && !config.containers.contains(&event.container) {
            continue;
        }
        if !config.rules.is_empty() {
            match transform_row(&event.fields, &config.rules, config.transform_endpoint.as_deref())
                .await
            {
                Ok(fields) => event.fields = fields,
                Err(err) => {
                    warn!(error = %err, container = %event.container, "transform failed, delivering original row");
                }
            }
        }
        (config.on_event)(event).await;
    }

    if !last_lsn.is_empty() {
        *position.write() = last_lsn.clone();
        if let Some(checkpoint) = &config.on_checkpoint {
            checkpoint(last_lsn).await;
        }
    }
    Ok(())
}

/// Parse one `test_decoding` output line.
///
/// Shapes handled:
/// `table public.t: INSERT: id[integer]:1 name[text]:'a'`
/// `table public.t: DELETE: id[integer]:1`
/// `BEGIN 742` / `COMMIT 742` yield `None`.
pub(crate) fn parse_test_decoding(line: &str) -> Option<CdcEvent> {
    let rest = line.strip_prefix("table ")?;
    let (qualified, rest) = rest.split_once(": ")?;
    let (op_text, column_text) = match rest.split_once(": ") {
        Some((op, cols)) => (op, cols),
        None => (rest.trim_end_matches(':'), ""),
    };
    let operation = match op_text {
        "INSERT" => CdcOperation::Create,
        "UPDATE" => CdcOperation::Update,
        "DELETE" => CdcOperation::Delete,
        _ => return None,
    };
    let container = qualified
        .rsplit_once('.')
        .map(|(_, table)| table)
        .unwrap_or(qualified)
        .to_string();

    let mut fields = Row::new();
    let mut input = column_text;
    while !input.trim().is_empty() {
        let (name, value, rest) = parse_column(input.trim_start())?;
        fields.insert(name, value);
        input = rest;
    }

    Some(CdcEvent {
        operation,
        container,
        fields,
        timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        provenance: Provenance {
            engine: EngineType::Postgres,
            mechanism: MECHANISM.to_string(),
        },
    })
}

/// Parse one `name[type]:value` unit; returns the remainder of the input.
fn parse_column(input: &str) -> Option<(String, Value, &str)> {
    let bracket = input.find('[')?;
    let name = input[..bracket].to_string();
    let close = input.find("]:")?;
    let type_name = &input[bracket + 1..close];
    let value_start = close + 2;
    let rest = &input[value_start..];

    if let Some(quoted) = rest.strip_prefix('\'') {
        // Quoted literal with '' escapes.
        let mut out = String::new();
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                if quoted[i + 1..].starts_with('\'') {
                    out.push('\'');
                    chars.next();
                } else {
                    return Some((name, Value::String(out), &quoted[i + 1..]));
                }
            } else {
                out.push(c);
            }
        }
        None
    } else {
        let end = rest.find(' ').unwrap_or(rest.len());
        let token = &rest[..end];
        let value = match token {
            "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => match type_name {
                "integer" | "bigint" | "smallint" => {
                    token.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::String(token.into()))
                }
                "real" | "double precision" | "numeric" => token
                    .parse::<f64>()
                    .map(Value::Float)
                    .unwrap_or_else(|_| Value::String(token.into())),
                _ => Value::String(token.to_string()),
            },
        };
        Some((name, value, &rest[end..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_insert_line() {
        let event = parse_test_decoding(
            "table public.t: INSERT: id[integer]:1 name[text]:'a' score[double precision]:0.5",
        )
        .unwrap();
        assert_eq!(event.operation, CdcOperation::Create);
        assert_eq!(event.container, "t");
        assert_eq!(event.fields.get("id"), Some(&Value::Int(1)));
        assert_eq!(event.fields.get("name"), Some(&Value::String("a".into())));
        assert_eq!(event.fields.get("score"), Some(&Value::Float(0.5)));
    }

    #[test]
    fn parses_quoted_string_with_escapes_and_spaces() {
        let event =
            parse_test_decoding("table public.t: UPDATE: id[integer]:2 note[text]:'it''s a test'")
                .unwrap();
        assert_eq!(event.operation, CdcOperation::Update);
        assert_eq!(
            event.fields.get("note"),
            Some(&Value::String("it's a test".into()))
        );
    }

    #[test]
    fn parses_delete_and_null() {
        let event =
            parse_test_decoding("table public.orders: DELETE: id[bigint]:9 ref[text]:null").unwrap();
        assert_eq!(event.operation, CdcOperation::Delete);
        assert_eq!(event.container, "orders");
        assert_eq!(event.fields.get("ref"), Some(&Value::Null));
    }

    #[test]
    fn transaction_markers_are_skipped() {
        assert!(parse_test_decoding("BEGIN 742").is_none());
        assert!(parse_test_decoding("COMMIT 742 (at 2024-05-01)").is_none());
    }

    #[test]
    fn unknown_op_is_skipped() {
        assert!(parse_test_decoding("table public.t: TRUNCATE:").is_none());
    }
}
