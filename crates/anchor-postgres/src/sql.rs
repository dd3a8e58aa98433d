//! SQL construction and value mapping helpers.
//!
//! Statements are built with quoted identifiers and numbered placeholders;
//! values travel through the extended protocol, never through string
//! interpolation.

use anchor::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tokio_postgres::types::{ToSql, Type};

/// Double-quote an identifier, escaping embedded quotes.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Forward map from a catalog type name (`udt_name`) to the unified
/// vocabulary. Unknown names fall back to `string`.
pub(crate) fn unified_type_from_pg(udt_name: &str) -> UnifiedDataType {
    match udt_name {
        "int2" | "int4" => UnifiedDataType::Integer,
        "int8" => UnifiedDataType::Bigint,
        "float4" | "float8" => UnifiedDataType::Float,
        "bool" => UnifiedDataType::Boolean,
        "timestamptz" => UnifiedDataType::Timestamp,
        "timestamp" => UnifiedDataType::Datetime,
        "date" => UnifiedDataType::Date,
        "time" | "timetz" => UnifiedDataType::Time,
        "bytea" => UnifiedDataType::Bytes,
        "numeric" => UnifiedDataType::Numeric,
        "json" | "jsonb" => UnifiedDataType::Json,
        "text" | "varchar" | "bpchar" | "name" | "uuid" => UnifiedDataType::String,
        other => UnifiedDataType::from_tag(other),
    }
}

/// Reverse map from the unified vocabulary to a column type. Extension
/// tags are emitted verbatim; the engine validates them.
pub(crate) fn pg_type_from_unified(data_type: &UnifiedDataType) -> String {
    match data_type {
        UnifiedDataType::String => "TEXT".into(),
        UnifiedDataType::Integer => "INTEGER".into(),
        UnifiedDataType::Bigint => "BIGINT".into(),
        UnifiedDataType::Float => "DOUBLE PRECISION".into(),
        UnifiedDataType::Boolean => "BOOLEAN".into(),
        UnifiedDataType::Timestamp => "TIMESTAMPTZ".into(),
        UnifiedDataType::Date => "DATE".into(),
        UnifiedDataType::Time => "TIME".into(),
        UnifiedDataType::Datetime => "TIMESTAMP".into(),
        UnifiedDataType::Bytes => "BYTEA".into(),
        UnifiedDataType::Numeric => "NUMERIC".into(),
        UnifiedDataType::Json => "JSONB".into(),
        UnifiedDataType::Extension(tag) => tag.clone(),
        _ => "TEXT".into(),
    }
}

/// `CREATE TABLE IF NOT EXISTS` for one unified table.
pub(crate) fn build_create_table(table: &Table) -> String {
    let mut columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| {
            let mut def = format!(
                "{} {}",
                quote_ident(&column.name),
                pg_type_from_unified(&column.data_type)
            );
            if column.auto_increment {
                def = format!("{} GENERATED BY DEFAULT AS IDENTITY", def);
            }
            if !column.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default_value {
                def.push_str(&format!(" DEFAULT {default}"));
            }
            def
        })
        .collect();

    let pk = table.primary_key_columns();
    if !pk.is_empty() {
        columns.push(format!(
            "PRIMARY KEY ({})",
            pk.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
        ));
    }

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&table.name),
        columns.join(", ")
    )
}

/// Multi-row `INSERT` with numbered placeholders. The column list is the
/// first row's; later rows contribute the matching values or NULL.
pub(crate) fn build_insert(table: &str, columns: &[String], row_count: usize) -> String {
    let mut placeholders = Vec::with_capacity(row_count);
    let mut n = 1;
    for _ in 0..row_count {
        let row: Vec<String> = (0..columns.len())
            .map(|_| {
                let p = format!("${n}");
                n += 1;
                p
            })
            .collect();
        placeholders.push(format!("({})", row.join(", ")));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        placeholders.join(", ")
    )
}

/// `UPDATE ... SET ... WHERE ...` for one row.
pub(crate) fn build_update(table: &str, set_columns: &[String], where_columns: &[String]) -> String {
    let mut n = 1;
    let set: Vec<String> = set_columns
        .iter()
        .map(|c| {
            let clause = format!("{} = ${n}", quote_ident(c));
            n += 1;
            clause
        })
        .collect();
    let wher: Vec<String> = where_columns
        .iter()
        .map(|c| {
            let clause = format!("{} = ${n}", quote_ident(c));
            n += 1;
            clause
        })
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table),
        set.join(", "),
        wher.join(" AND ")
    )
}

/// `INSERT ... ON CONFLICT (unique) DO UPDATE` for one row.
pub(crate) fn build_upsert(table: &str, columns: &[String], unique_columns: &[String]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|n| format!("${n}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !unique_columns.contains(c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        quote_ident(table),
        columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        unique_columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        action
    )
}

/// `DELETE ... WHERE ...` with equality AND over the condition columns.
pub(crate) fn build_delete(table: &str, columns: &[String]) -> String {
    let wher: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect();
    format!("DELETE FROM {} WHERE {}", quote_ident(table), wher.join(" AND "))
}

/// A [`Value`] rendered as a tokio-postgres parameter.
pub(crate) fn to_sql_param(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int(n) => Box::new(*n),
        Value::Float(f) => Box::new(*f),
        Value::Bytes(b) => Box::new(b.clone()),
        Value::String(s) => Box::new(s.clone()),
        Value::Timestamp(ts) => Box::new(*ts),
        Value::List(_) | Value::Map(_) => Box::new(value.to_json()),
    }
}

pub(crate) fn params_for(values: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    values.iter().map(to_sql_param).collect()
}

pub(crate) fn param_refs(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

/// Decode one result column into a [`Value`] using the wire type.
///
/// NUMERIC has no zero-dependency binary decoding; it and any other
/// unmapped type go through a text fallback and surface as strings.
pub(crate) fn value_from_column(row: &tokio_postgres::Row, index: usize) -> Value {
    let column_type = row.columns()[index].type_();
    let decoded = match *column_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(index).map(|v| v.map(Value::Bool)),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)
            .map(|v| v.map(|n| Value::Int(i64::from(n)))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)
            .map(|v| v.map(|n| Value::Int(i64::from(n)))),
        Type::INT8 => row.try_get::<_, Option<i64>>(index).map(|v| v.map(Value::Int)),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)
            .map(|v| v.map(|f| Value::Float(f64::from(f)))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).map(|v| v.map(Value::Float)),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(index)
            .map(|v| v.map(Value::Bytes)),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)
            .map(|v| v.map(Value::Timestamp)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)
            .map(|v| v.map(|dt| Value::Timestamp(dt.and_utc()))),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(index)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(index)
            .map(|v| v.map(|t| Value::String(t.to_string()))),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)
            .map(|v| v.map(Value::from_json)),
        _ => row
            .try_get::<_, Option<String>>(index)
            .map(|v| v.map(Value::String)),
    };
    match decoded {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        // Type the map did not anticipate; last resort is text.
        Err(_) => row
            .try_get::<_, Option<String>>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Decode a full result row into a [`Row`].
pub(crate) fn row_from_pg(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| (column.name().to_string(), value_from_column(row, i)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idents_are_quoted_and_escaped() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn create_table_includes_primary_key() {
        let table = Table::new("t")
            .with_column(Column::new("id", UnifiedDataType::Bigint).primary_key())
            .with_column(Column::new("name", UnifiedDataType::String));
        let ddl = build_create_table(&table);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"t\" (\"id\" BIGINT NOT NULL, \"name\" TEXT, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn insert_numbers_placeholders_across_rows() {
        let sql = build_insert("t", &["a".into(), "b".into()], 2);
        assert_eq!(
            sql,
            "INSERT INTO \"t\" (\"a\", \"b\") VALUES ($1, $2), ($3, $4)"
        );
    }

    #[test]
    fn upsert_excludes_key_columns_from_update() {
        let sql = build_upsert("t", &["id".into(), "name".into()], &["id".into()]);
        assert!(sql.contains("ON CONFLICT (\"id\")"));
        assert!(sql.contains("\"name\" = EXCLUDED.\"name\""));
        assert!(!sql.contains("\"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn upsert_with_only_key_columns_does_nothing() {
        let sql = build_upsert("t", &["id".into()], &["id".into()]);
        assert!(sql.ends_with("DO NOTHING"));
    }

    #[test]
    fn type_maps_round_trip_the_core_vocabulary() {
        for (pg, unified) in [
            ("int8", UnifiedDataType::Bigint),
            ("bool", UnifiedDataType::Boolean),
            ("timestamptz", UnifiedDataType::Timestamp),
            ("jsonb", UnifiedDataType::Json),
            ("bytea", UnifiedDataType::Bytes),
        ] {
            assert_eq!(unified_type_from_pg(pg), unified);
        }
        assert_eq!(
            unified_type_from_pg("geography"),
            UnifiedDataType::Extension("geography".into())
        );
        assert_eq!(pg_type_from_unified(&UnifiedDataType::Json), "JSONB");
    }

    #[test]
    fn delete_builds_equality_and() {
        let sql = build_delete("t", &["a".into(), "b".into()]);
        assert_eq!(sql, "DELETE FROM \"t\" WHERE \"a\" = $1 AND \"b\" = $2");
    }
}
