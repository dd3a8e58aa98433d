//! Schema discovery and structure creation.

use crate::postgres::PgHandle;
use crate::sql::{build_create_table, quote_ident, unified_type_from_pg};
use anchor::adapter::{ConnState, SchemaOperator};
use anchor::model::{EnumDef, Sequence, View};
use anchor::prelude::*;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PostgresSchema {
    state: Arc<ConnState>,
    handle: Arc<PgHandle>,
}

impl PostgresSchema {
    pub(crate) fn new(state: Arc<ConnState>, handle: Arc<PgHandle>) -> PostgresSchema {
        PostgresSchema { state, handle }
    }

    async fn discover_columns(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT c.table_name, c.column_name, c.udt_name, \
             c.is_nullable = 'YES' AS nullable, \
             c.column_default, \
             c.is_identity = 'YES' OR c.column_default LIKE 'nextval(%' AS auto_increment \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
             WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE' \
             ORDER BY c.table_name, c.ordinal_position";
        for row in self.handle.query(SQL, &[]).await? {
            let table_name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let column_name: String = row.try_get(1).map_err(|e| Error::query(SQL, e))?;
            let udt_name: String = row.try_get(2).map_err(|e| Error::query(SQL, e))?;
            let nullable: bool = row.try_get(3).unwrap_or(true);
            let default_value: Option<String> = row.try_get(4).ok().flatten();
            let auto_increment: bool = row.try_get(5).unwrap_or(false);

            let table = model
                .tables
                .entry(table_name.clone())
                .or_insert_with(|| Table::new(table_name));
            let mut column = Column::new(column_name, unified_type_from_pg(&udt_name));
            column.nullable = nullable;
            column.auto_increment = auto_increment;
            column.default_value = default_value;
            table.columns.push(column);
        }
        Ok(())
    }

    async fn discover_primary_keys(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT tc.table_name, kcu.column_name \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name \
              AND kcu.table_schema = tc.table_schema \
             WHERE tc.table_schema = 'public' AND tc.constraint_type = 'PRIMARY KEY'";
        for row in self.handle.query(SQL, &[]).await? {
            let table_name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let column_name: String = row.try_get(1).map_err(|e| Error::query(SQL, e))?;
            if let Some(table) = model.tables.get_mut(&table_name) {
                if let Some(column) = table.columns.iter_mut().find(|c| c.name == column_name) {
                    column.primary_key = true;
                    column.nullable = false;
                }
            }
        }
        Ok(())
    }

    async fn discover_indexes(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT t.relname, i.relname, ix.indisunique, a.attname \
             FROM pg_index ix \
             JOIN pg_class t ON t.oid = ix.indrelid \
             JOIN pg_class i ON i.oid = ix.indexrelid \
             JOIN pg_namespace n ON n.oid = t.relnamespace \
             JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
             WHERE n.nspname = 'public' AND NOT ix.indisprimary \
             ORDER BY t.relname, i.relname";
        for row in self.handle.query(SQL, &[]).await? {
            let table_name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let index_name: String = row.try_get(1).map_err(|e| Error::query(SQL, e))?;
            let unique: bool = row.try_get(2).unwrap_or(false);
            let column_name: String = row.try_get(3).map_err(|e| Error::query(SQL, e))?;
            if let Some(table) = model.tables.get_mut(&table_name) {
                match table.indexes.iter_mut().find(|ix| ix.name == index_name) {
                    Some(index) => index.columns.push(column_name),
                    None => table.indexes.push(Index {
                        name: index_name,
                        columns: vec![column_name],
                        unique,
                    }),
                }
            }
        }
        Ok(())
    }

    async fn discover_views(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT table_name, COALESCE(view_definition, '') \
             FROM information_schema.views WHERE table_schema = 'public'";
        for row in self.handle.query(SQL, &[]).await? {
            let name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let definition: String = row.try_get(1).unwrap_or_default();
            model.views.insert(name.clone(), View { name, definition });
        }
        Ok(())
    }

    async fn discover_sequences(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT sequence_name, COALESCE(start_value::bigint, 1), \
             COALESCE(increment::bigint, 1) \
             FROM information_schema.sequences WHERE sequence_schema = 'public'";
        for row in self.handle.query(SQL, &[]).await? {
            let name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let start: i64 = row.try_get(1).unwrap_or(1);
            let increment: i64 = row.try_get(2).unwrap_or(1);
            model.sequences.insert(
                name.clone(),
                Sequence {
                    name,
                    start,
                    increment,
                },
            );
        }
        Ok(())
    }

    async fn discover_enums(&self, model: &mut UnifiedModel) -> Result<()> {
        const SQL: &str = "SELECT t.typname, e.enumlabel \
             FROM pg_type t \
             JOIN pg_enum e ON e.enumtypid = t.oid \
             JOIN pg_namespace n ON n.oid = t.typnamespace \
             WHERE n.nspname = 'public' ORDER BY t.typname, e.enumsortorder";
        for row in self.handle.query(SQL, &[]).await? {
            let name: String = row.try_get(0).map_err(|e| Error::query(SQL, e))?;
            let label: String = row.try_get(1).map_err(|e| Error::query(SQL, e))?;
            model
                .enums
                .entry(name.clone())
                .or_insert_with(|| EnumDef {
                    name,
                    values: Vec::new(),
                })
                .values
                .push(label);
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaOperator for PostgresSchema {
    async fn discover_schema(&self) -> Result<UnifiedModel> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::new(self.handle.database.clone());
        self.discover_columns(&mut model).await?;
        self.discover_primary_keys(&mut model).await?;
        self.discover_indexes(&mut model).await?;
        self.discover_views(&mut model).await?;
        self.discover_sequences(&mut model).await?;
        self.discover_enums(&mut model).await?;
        debug!(tables = model.tables.len(), "discovered postgres schema");
        Ok(model)
    }

    async fn create_structure(&self, model: &UnifiedModel) -> Result<()> {
        self.state.ensure_open()?;
        for table in model.tables.values() {
            let ddl = build_create_table(table);
            self.handle.execute(&ddl, &[]).await?;
            for index in &table.indexes {
                let unique = if index.unique { "UNIQUE " } else { "" };
                let columns = index
                    .columns
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    unique,
                    quote_ident(&index.name),
                    quote_ident(&table.name),
                    columns
                );
                self.handle.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.state.ensure_open()?;
        const SQL: &str = "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name";
        let rows = self.handle.query(SQL, &[]).await?;
        Ok(rows.iter().filter_map(|r| r.try_get(0).ok()).collect())
    }

    async fn get_table_schema(&self, table: &str) -> Result<Table> {
        self.state.ensure_open()?;
        let mut model = UnifiedModel::default();
        self.discover_columns(&mut model).await?;
        self.discover_primary_keys(&mut model).await?;
        model
            .tables
            .remove(table)
            .ok_or_else(|| Error::NotFound(format!("table {table}")))
    }
}
