//! CQL literal rendering and result decoding.

use anchor::prelude::*;
use chrono::{TimeZone, Utc};
use scylla::frame::response::result::CqlValue;

/// Double-quote an identifier.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a [`Value`] as a CQL literal with single-quote escaping.
pub(crate) fn literal(value: &Value) -> String {
    match value {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => {
            if f.is_finite() {
                f.to_string()
            } else {
                "null".into()
            }
        }
        Value::Bytes(bytes) => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("0x");
            for byte in bytes {
                out.push_str(&format!("{byte:02x}"));
            }
            out
        }
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Timestamp(ts) => ts.timestamp_millis().to_string(),
        Value::List(_) | Value::Map(_) => {
            format!("'{}'", value.to_json().to_string().replace('\'', "''"))
        }
    }
}

pub(crate) fn cql_to_value(cql: &CqlValue) -> Value {
    match cql {
        CqlValue::Empty => Value::Null,
        CqlValue::Boolean(b) => Value::Bool(*b),
        CqlValue::TinyInt(n) => Value::Int(i64::from(*n)),
        CqlValue::SmallInt(n) => Value::Int(i64::from(*n)),
        CqlValue::Int(n) => Value::Int(i64::from(*n)),
        CqlValue::BigInt(n) => Value::Int(*n),
        CqlValue::Counter(c) => Value::Int(c.0),
        CqlValue::Float(f) => Value::Float(f64::from(*f)),
        CqlValue::Double(f) => Value::Float(*f),
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s.clone()),
        CqlValue::Blob(bytes) => Value::Bytes(bytes.clone()),
        CqlValue::Timestamp(ts) => Value::Timestamp(
            Utc.timestamp_millis_opt(ts.0).single().unwrap_or_default(),
        ),
        CqlValue::Uuid(uuid) => Value::String(uuid.to_string()),
        CqlValue::Timeuuid(uuid) => Value::String(uuid.to_string()),
        CqlValue::Inet(addr) => Value::String(addr.to_string()),
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::List(items.iter().map(cql_to_value).collect())
        }
        CqlValue::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (cql_to_value(k).to_parameter_string(), cql_to_value(v)))
                .collect(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}

pub(crate) fn unified_type_from_cql(native: &str) -> UnifiedDataType {
    match native {
        "tinyint" | "smallint" | "int" => UnifiedDataType::Integer,
        "bigint" | "counter" | "varint" => UnifiedDataType::Bigint,
        "float" | "double" => UnifiedDataType::Float,
        "boolean" => UnifiedDataType::Boolean,
        "timestamp" => UnifiedDataType::Timestamp,
        "date" => UnifiedDataType::Date,
        "time" => UnifiedDataType::Time,
        "blob" => UnifiedDataType::Bytes,
        "decimal" => UnifiedDataType::Numeric,
        "ascii" | "text" | "varchar" | "uuid" | "timeuuid" | "inet" => UnifiedDataType::String,
        other => UnifiedDataType::from_tag(other),
    }
}

pub(crate) fn cql_type_from_unified(data_type: &UnifiedDataType) -> String {
    match data_type {
        UnifiedDataType::String => "text".into(),
        UnifiedDataType::Integer => "int".into(),
        UnifiedDataType::Bigint => "bigint".into(),
        UnifiedDataType::Float => "double".into(),
        UnifiedDataType::Boolean => "boolean".into(),
        UnifiedDataType::Timestamp | UnifiedDataType::Datetime => "timestamp".into(),
        UnifiedDataType::Date => "date".into(),
        UnifiedDataType::Time => "time".into(),
        UnifiedDataType::Bytes => "blob".into(),
        UnifiedDataType::Numeric => "decimal".into(),
        UnifiedDataType::Json => "text".into(),
        UnifiedDataType::Extension(tag) => tag.clone(),
        _ => "text".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_literals_escape_quotes() {
        assert_eq!(literal(&Value::String("it's".into())), "'it''s'");
    }

    #[test]
    fn bytes_render_as_hex() {
        assert_eq!(literal(&Value::Bytes(vec![0xDE, 0xAD])), "0xdead");
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(literal(&Value::Float(f64::NAN)), "null");
        assert_eq!(literal(&Value::Float(1.5)), "1.5");
    }

    #[test]
    fn type_maps_cover_cassandra_vocabulary() {
        assert_eq!(unified_type_from_cql("counter"), UnifiedDataType::Bigint);
        assert_eq!(unified_type_from_cql("timeuuid"), UnifiedDataType::String);
        assert_eq!(cql_type_from_unified(&UnifiedDataType::Json), "text");
    }
}
