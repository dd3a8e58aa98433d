//! Dynamic row values.
//!
//! The data path trades in `name -> value` maps. `Value` is a small tagged
//! union rather than a blanket `serde_json::Value` so adapters keep byte and
//! timestamp fidelity when shuttling rows between engines; conversion to and
//! from JSON happens only at serialization boundaries (wire frames, provider
//! payloads), where bytes become base64 and timestamps become RFC 3339.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL / missing field.
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Raw bytes; base64 when rendered as JSON.
    Bytes(Vec<u8>),
    String(String),
    /// UTC instant; RFC 3339 when rendered as JSON.
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// One record keyed by column/field name.
pub type Row = BTreeMap<String, Value>;

impl Value {
    /// Borrow as a string when the variant carries one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Project into JSON. Bytes become base64 strings, timestamps RFC 3339.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Lift a JSON value. Strings stay strings; there is no sniffing of
    /// base64 or timestamps on the way in, the engine schema decides that.
    pub fn from_json(value: serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render for engines that want a plain text parameter. Nested structures
    /// are serialized to JSON text, matching the stream-bridge contract, and
    /// bytes become base64.
    pub fn to_parameter_string(&self) -> String {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => BASE64.encode(b),
            Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
            Value::List(_) | Value::Map(_) => self.to_json().to_string(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
            Value::List(items) => write!(f, "[{} items]", items.len()),
            Value::Map(map) => write!(f, "{{{} fields}}", map.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(ts)
    }
}

/// Convert a full row to a JSON object.
pub fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

/// Build a row from a JSON object; non-object values land under `data`,
/// matching the stream-bridge envelope rule.
pub fn row_from_json(value: serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect(),
        other => {
            let mut row = Row::new();
            row.insert("data".to_string(), Value::from_json(other));
            row
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn json_round_trip_preserves_scalars() {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(7));
        row.insert("name".into(), Value::String("anchor".into()));
        row.insert("ok".into(), Value::Bool(true));
        row.insert("score".into(), Value::Float(0.5));
        row.insert("missing".into(), Value::Null);

        let round = row_from_json(row_to_json(&row));
        assert_eq!(round, row);
    }

    #[test]
    fn bytes_render_as_base64() {
        let v = Value::Bytes(vec![0xDE, 0xAD]);
        assert_eq!(v.to_json(), serde_json::json!("3q0="));
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let v = Value::Timestamp(ts);
        assert_eq!(v.to_json(), serde_json::json!("2024-05-01T12:00:00.000000Z"));
    }

    #[test]
    fn scalar_envelope_is_wrapped_under_data() {
        let row = row_from_json(serde_json::json!("bare"));
        assert_eq!(row.get("data"), Some(&Value::String("bare".into())));
    }

    #[test]
    fn nested_values_stringify_for_parameters() {
        let v = Value::Map(BTreeMap::from([("k".to_string(), Value::Int(1))]));
        assert_eq!(v.to_parameter_string(), r#"{"k":1}"#);
    }
}
