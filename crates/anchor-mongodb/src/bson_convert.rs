//! BSON <-> unified value conversion.

use anchor::prelude::*;
use bson::{Bson, Document};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

pub(crate) fn bson_to_value(bson: &Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(n) => Value::Int(i64::from(*n)),
        Bson::Int64(n) => Value::Int(*n),
        Bson::Double(f) => Value::Float(*f),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Binary(bin) => Value::Bytes(bin.bytes.clone()),
        Bson::DateTime(dt) => Value::Timestamp(
            Utc.timestamp_millis_opt(dt.timestamp_millis())
                .single()
                .unwrap_or_default(),
        ),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::Decimal128(d) => Value::String(d.to_string()),
        Bson::Array(items) => Value::List(items.iter().map(bson_to_value).collect()),
        Bson::Document(doc) => Value::Map(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_value(v)))
                .collect::<BTreeMap<_, _>>(),
        ),
        other => Value::String(other.to_string()),
    }
}

pub(crate) fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(n) => Bson::Int64(*n),
        Value::Float(f) => Bson::Double(*f),
        Value::Bytes(b) => Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: b.clone(),
        }),
        Value::String(s) => Bson::String(s.clone()),
        Value::Timestamp(ts) => Bson::DateTime(bson::DateTime::from_millis(ts.timestamp_millis())),
        Value::List(items) => Bson::Array(items.iter().map(value_to_bson).collect()),
        Value::Map(map) => Bson::Document(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_bson(v)))
                .collect(),
        ),
    }
}

pub(crate) fn document_to_row(doc: &Document) -> Row {
    doc.iter()
        .map(|(k, v)| (k.clone(), bson_to_value(v)))
        .collect()
}

pub(crate) fn row_to_document(row: &Row) -> Document {
    row.iter()
        .map(|(k, v)| (k.clone(), value_to_bson(v)))
        .collect()
}

/// Unified column type for one BSON value, for sampled pseudo-schemas.
pub(crate) fn unified_type_of(bson: &Bson) -> UnifiedDataType {
    match bson {
        Bson::Boolean(_) => UnifiedDataType::Boolean,
        Bson::Int32(_) => UnifiedDataType::Integer,
        Bson::Int64(_) => UnifiedDataType::Bigint,
        Bson::Double(_) | Bson::Decimal128(_) => UnifiedDataType::Float,
        Bson::DateTime(_) => UnifiedDataType::Timestamp,
        Bson::Binary(_) => UnifiedDataType::Bytes,
        Bson::Array(_) | Bson::Document(_) => UnifiedDataType::Json,
        _ => UnifiedDataType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn document_round_trip_keeps_scalars() {
        let doc = doc! {"id": 7i64, "name": "anchor", "ok": true, "score": 0.5};
        let row = document_to_row(&doc);
        assert_eq!(row.get("id"), Some(&Value::Int(7)));
        let back = row_to_document(&row);
        assert_eq!(back.get_i64("id").unwrap(), 7);
        assert_eq!(back.get_str("name").unwrap(), "anchor");
    }

    #[test]
    fn object_ids_become_hex_strings() {
        let oid = bson::oid::ObjectId::new();
        assert_eq!(
            bson_to_value(&Bson::ObjectId(oid)),
            Value::String(oid.to_hex())
        );
    }

    #[test]
    fn nested_documents_map_to_json_type() {
        assert_eq!(unified_type_of(&Bson::Document(doc! {"a": 1})), UnifiedDataType::Json);
        assert_eq!(unified_type_of(&Bson::Int32(1)), UnifiedDataType::Integer);
    }
}
