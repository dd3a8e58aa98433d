//! Statement builders and value mapping for MySQL.

use anchor::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::{Column as _, Row as _, TypeInfo as _};

/// Backtick-quote an identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

pub(crate) fn unified_type_from_mysql(data_type: &str) -> UnifiedDataType {
    match data_type.to_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" => UnifiedDataType::Integer,
        "bigint" => UnifiedDataType::Bigint,
        "float" | "double" => UnifiedDataType::Float,
        "bit" | "bool" | "boolean" => UnifiedDataType::Boolean,
        "timestamp" => UnifiedDataType::Timestamp,
        "datetime" => UnifiedDataType::Datetime,
        "date" => UnifiedDataType::Date,
        "time" => UnifiedDataType::Time,
        "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
            UnifiedDataType::Bytes
        }
        "decimal" | "numeric" => UnifiedDataType::Numeric,
        "json" => UnifiedDataType::Json,
        "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum" | "set" => {
            UnifiedDataType::String
        }
        other => UnifiedDataType::from_tag(other),
    }
}

pub(crate) fn mysql_type_from_unified(data_type: &UnifiedDataType) -> String {
    match data_type {
        UnifiedDataType::String => "TEXT".into(),
        UnifiedDataType::Integer => "INT".into(),
        UnifiedDataType::Bigint => "BIGINT".into(),
        UnifiedDataType::Float => "DOUBLE".into(),
        UnifiedDataType::Boolean => "BOOLEAN".into(),
        UnifiedDataType::Timestamp => "TIMESTAMP".into(),
        UnifiedDataType::Date => "DATE".into(),
        UnifiedDataType::Time => "TIME".into(),
        UnifiedDataType::Datetime => "DATETIME".into(),
        UnifiedDataType::Bytes => "BLOB".into(),
        UnifiedDataType::Numeric => "DECIMAL(38,9)".into(),
        UnifiedDataType::Json => "JSON".into(),
        UnifiedDataType::Extension(tag) => tag.clone(),
        _ => "TEXT".into(),
    }
}

/// `CREATE TABLE IF NOT EXISTS`; TEXT primary keys get a prefix length the
/// way MySQL requires.
pub(crate) fn build_create_table(table: &Table) -> String {
    let mut defs: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut native = mysql_type_from_unified(&column.data_type);
            if column.primary_key && native == "TEXT" {
                native = "VARCHAR(255)".into();
            }
            let mut def = format!("{} {}", quote_ident(&column.name), native);
            if !column.nullable {
                def.push_str(" NOT NULL");
            }
            if column.auto_increment {
                def.push_str(" AUTO_INCREMENT");
            }
            if let Some(default) = &column.default_value {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            def
        })
        .collect();
    let pk = table.primary_key_columns();
    if !pk.is_empty() {
        defs.push(format!(
            "PRIMARY KEY ({})",
            pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        defs.join(", ")
    )
}

pub(crate) fn build_insert(table: &str, columns: &[String], row_count: usize) -> String {
    let row = format!("({})", vec!["?"; columns.len()].join(", "));
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        vec![row; row_count].join(", ")
    )
}

pub(crate) fn build_update(table: &str, set_columns: &[String], where_columns: &[String]) -> String {
    format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table),
        set_columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", "),
        where_columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ")
    )
}

pub(crate) fn build_upsert(table: &str, columns: &[String], unique_columns: &[String]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !unique_columns.contains(c))
        .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
        .collect();
    let update_clause = if updates.is_empty() {
        // Touch a key column so the statement stays valid syntax.
        format!(
            "{0} = {0}",
            quote_ident(unique_columns.first().map(String::as_str).unwrap_or("id"))
        )
    } else {
        updates.join(", ")
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        vec!["?"; columns.len()].join(", "),
        update_clause
    )
}

pub(crate) fn build_delete(table: &str, columns: &[String]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(table),
        columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" AND ")
    )
}

/// Bind a [`Value`] onto a sqlx query.
pub(crate) fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Int(n) => query.bind(*n),
        Value::Float(f) => query.bind(*f),
        Value::Bytes(b) => query.bind(b.clone()),
        Value::String(s) => query.bind(s.clone()),
        Value::Timestamp(ts) => query.bind(*ts),
        Value::List(_) | Value::Map(_) => query.bind(value.to_json().to_string()),
    }
}

/// Decode one sqlx row. Text columns arriving as byte buffers are coerced
/// to strings; unmapped wire types fall back to a lossy text read.
pub(crate) fn row_from_mysql(row: &MySqlRow) -> Row {
    row.columns()
        .iter()
        .map(|column| {
            let i = column.ordinal();
            let name = column.name().to_string();
            let value = match column.type_info().name() {
                "BOOLEAN" | "BOOL" => row
                    .try_get::<Option<bool>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Bool),
                "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => row
                    .try_get::<Option<i64>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Int),
                "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "INT UNSIGNED" | "BIGINT UNSIGNED" => {
                    row.try_get::<Option<u64>, _>(i)
                        .ok()
                        .flatten()
                        .map_or(Value::Null, |n| Value::Int(n as i64))
                }
                "FLOAT" => row
                    .try_get::<Option<f32>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |f| Value::Float(f64::from(f))),
                "DOUBLE" => row
                    .try_get::<Option<f64>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Float),
                "TIMESTAMP" => row
                    .try_get::<Option<DateTime<Utc>>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Timestamp),
                "DATETIME" => row
                    .try_get::<Option<NaiveDateTime>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |dt| Value::Timestamp(dt.and_utc())),
                "DATE" => row
                    .try_get::<Option<NaiveDate>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |d| Value::String(d.to_string())),
                "TIME" => row
                    .try_get::<Option<NaiveTime>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, |t| Value::String(t.to_string())),
                "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => row
                    .try_get::<Option<Vec<u8>>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::Bytes),
                "JSON" => row
                    .try_get::<Option<serde_json::Value>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::from_json),
                _ => row
                    .try_get::<Option<String>, _>(i)
                    .ok()
                    .flatten()
                    .map_or(Value::Null, Value::String),
            };
            (name, value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_use_backticks() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn text_primary_keys_become_varchar() {
        let table = Table::new("t")
            .with_column(Column::new("k", UnifiedDataType::String).primary_key());
        let ddl = build_create_table(&table);
        assert!(ddl.contains("`k` VARCHAR(255) NOT NULL"));
        assert!(ddl.contains("PRIMARY KEY (`k`)"));
    }

    #[test]
    fn upsert_uses_on_duplicate_key() {
        let sql = build_upsert("t", &["id".into(), "name".into()], &["id".into()]);
        assert!(sql.contains("ON DUPLICATE KEY UPDATE `name` = VALUES(`name`)"));
    }

    #[test]
    fn insert_repeats_placeholder_groups() {
        assert_eq!(
            build_insert("t", &["a".into(), "b".into()], 2),
            "INSERT INTO `t` (`a`, `b`) VALUES (?, ?), (?, ?)"
        );
    }

    #[test]
    fn type_map_covers_common_names() {
        assert_eq!(unified_type_from_mysql("BIGINT"), UnifiedDataType::Bigint);
        assert_eq!(unified_type_from_mysql("longtext"), UnifiedDataType::String);
        assert_eq!(
            unified_type_from_mysql("geometry"),
            UnifiedDataType::Extension("geometry".into())
        );
    }
}
