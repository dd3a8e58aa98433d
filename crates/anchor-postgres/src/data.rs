//! Row-level data operations.

use crate::postgres::PgHandle;
use crate::sql::{
    build_delete, build_insert, build_update, build_upsert, param_refs, params_for, quote_ident,
};
use anchor::adapter::{ConnState, DataOperator, StreamParams, StreamResult};
use anchor::prelude::*;
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) struct PostgresData {
    state: Arc<ConnState>,
    handle: Arc<PgHandle>,
}

impl PostgresData {
    pub(crate) fn new(state: Arc<ConnState>, handle: Arc<PgHandle>) -> PostgresData {
        PostgresData { state, handle }
    }

    /// Column list inferred from the first row; later rows contribute
    /// matching values or NULL.
    fn collect_insert_values(columns: &[String], rows: &[Row]) -> Vec<Value> {
        let mut values = Vec::with_capacity(columns.len() * rows.len());
        for row in rows {
            for column in columns {
                values.push(row.get(column).cloned().unwrap_or(Value::Null));
            }
        }
        values
    }
}

#[async_trait]
impl DataOperator for PostgresData {
    async fn fetch(&self, table: &str, limit: usize) -> Result<Vec<Row>> {
        self.fetch_with_columns(table, &[], limit).await
    }

    async fn fetch_with_columns(
        &self,
        table: &str,
        columns: &[String],
        limit: usize,
    ) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        };
        let sql = format!(
            "SELECT {} FROM {} LIMIT {}",
            projection,
            quote_ident(table),
            limit as i64
        );
        self.handle.query_rows(&sql, &[]).await
    }

    async fn insert(&self, table: &str, rows: &[Row]) -> Result<u64> {
        self.state.ensure_open()?;
        let Some(first) = rows.first() else {
            return Ok(0);
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let sql = build_insert(table, &columns, rows.len());
        let values = Self::collect_insert_values(&columns, rows);
        let params = params_for(&values);
        self.handle.execute(&sql, &param_refs(&params)).await
    }

    async fn update(&self, table: &str, rows: &[Row], where_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if where_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "update requires at least one where column".into(),
            ));
        }
        let mut affected = 0u64;
        for row in rows {
            let set_columns: Vec<String> = row
                .keys()
                .filter(|k| !where_columns.contains(k))
                .cloned()
                .collect();
            if set_columns.is_empty() {
                continue;
            }
            let mut values: Vec<Value> = set_columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            for column in where_columns {
                let value = row.get(column).cloned().ok_or_else(|| {
                    Error::InvalidConfiguration(format!("update row is missing where column {column}"))
                })?;
                values.push(value);
            }
            let sql = build_update(table, &set_columns, where_columns);
            let params = params_for(&values);
            affected += self.handle.execute(&sql, &param_refs(&params)).await?;
        }
        Ok(affected)
    }

    async fn upsert(&self, table: &str, rows: &[Row], unique_columns: &[String]) -> Result<u64> {
        self.state.ensure_open()?;
        if rows.is_empty() {
            return Ok(0);
        }
        if unique_columns.is_empty() {
            return Err(Error::InvalidConfiguration(
                "upsert requires at least one unique column".into(),
            ));
        }
        let mut affected = 0u64;
        for row in rows {
            let columns: Vec<String> = row.keys().cloned().collect();
            let values: Vec<Value> = columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect();
            let sql = build_upsert(table, &columns, unique_columns);
            let params = params_for(&values);
            self.handle.execute(&sql, &param_refs(&params)).await?;
            // ON CONFLICT reports 1 for insert and update alike.
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(&self, table: &str, conditions: &Row) -> Result<u64> {
        self.state.ensure_open()?;
        if conditions.is_empty() {
            return Ok(0);
        }
        let columns: Vec<String> = conditions.keys().cloned().collect();
        let values: Vec<Value> = columns
            .iter()
            .map(|c| conditions.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        let sql = build_delete(table, &columns);
        let params = params_for(&values);
        self.handle.execute(&sql, &param_refs(&params)).await
    }

    async fn stream(&self, params: &StreamParams) -> Result<StreamResult> {
        self.state.ensure_open()?;
        let offset = params.offset()?;
        let projection = if params.columns.is_empty() {
            "*".to_string()
        } else {
            params
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", projection, quote_ident(&params.table));
        if let Some(filter) = &params.filter {
            if !filter.trim().is_empty() {
                sql.push_str(&format!(" WHERE {filter}"));
            }
        }
        sql.push_str(&format!(" LIMIT {} OFFSET {}", params.batch_size, offset));
        let rows = self.handle.query_rows(&sql, &[]).await?;
        Ok(StreamResult::offset_page(rows, params.batch_size, offset))
    }

    async fn execute_query(&self, query: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.state.ensure_open()?;
        let params = params_for(args);
        self.handle.query_rows(query, &param_refs(&params)).await
    }

    async fn execute_count_query(&self, query: &str) -> Result<i64> {
        self.state.ensure_open()?;
        let rows = self.handle.query(query, &[]).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::query(query, std::io::Error::other("empty count result")))?;
        row.try_get::<_, i64>(0)
            .or_else(|_| row.try_get::<_, i32>(0).map(i64::from))
            .map_err(|err| Error::query(query, err))
    }

    async fn get_row_count(&self, table: &str, where_clause: Option<&str>) -> Result<(i64, bool)> {
        self.state.ensure_open()?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        if let Some(clause) = where_clause {
            if !clause.trim().is_empty() {
                sql.push_str(&format!(" WHERE {clause}"));
            }
        }
        Ok((self.handle.query_scalar(&sql).await?, true))
    }

    async fn wipe(&self) -> Result<()> {
        self.state.ensure_open()?;
        const SQL: &str = "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE'";
        let tables: Vec<String> = self
            .handle
            .query(SQL, &[])
            .await?
            .iter()
            .filter_map(|r| r.try_get(0).ok())
            .collect();
        for table in tables {
            let sql = format!("TRUNCATE TABLE {} CASCADE", quote_ident(&table));
            self.handle.execute(&sql, &[]).await?;
        }
        Ok(())
    }
}
