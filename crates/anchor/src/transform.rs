//! Row transformation rules.
//!
//! Shared by the replication engine and the stream bridge. Built-in kinds
//! cover field renaming and simple string normalization; anything richer is
//! delegated to an external transformation service over HTTP when an
//! endpoint is configured. Unknown rule kinds pass the value through
//! unchanged and are logged once per batch at warn level.

use crate::error::{Error, Result};
use crate::value::{row_from_json, row_to_json, Row, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// One field-level transformation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRule {
    /// Source field name.
    pub source: String,
    /// Target field name; equal to `source` for in-place transforms.
    pub target: String,
    #[serde(rename = "transform")]
    pub kind: TransformKind,
}

/// Built-in transformation kinds. Unknown wire tags deserialize into
/// [`TransformKind::Other`] and behave as pass-through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    DirectMapping,
    Uppercase,
    Lowercase,
    Trim,
    #[serde(untagged)]
    Other(String),
}

impl TransformRule {
    fn apply_value(&self, value: &Value) -> Value {
        match &self.kind {
            TransformKind::DirectMapping => value.clone(),
            TransformKind::Uppercase => map_string(value, str::to_uppercase),
            TransformKind::Lowercase => map_string(value, str::to_lowercase),
            TransformKind::Trim => map_string(value, |s| s.trim().to_string()),
            TransformKind::Other(kind) => {
                warn!(kind = %kind, source = %self.source, "unknown transformation type, passing value through");
                value.clone()
            }
        }
    }
}

fn map_string(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

/// Apply a rule set to one row. Fields without a matching rule are kept
/// as-is; a rule whose source field is absent is skipped.
pub fn apply_rules(row: &Row, rules: &[TransformRule]) -> Row {
    if rules.is_empty() {
        return row.clone();
    }
    let mut out = row.clone();
    for rule in rules {
        let Some(value) = row.get(&rule.source) else {
            continue;
        };
        let transformed = rule.apply_value(value);
        if rule.target != rule.source {
            out.remove(&rule.source);
        }
        out.insert(rule.target.clone(), transformed);
    }
    out
}

/// Client for the external transformation service. Posts the row and the
/// rule set, receives the transformed row.
#[derive(Debug, Clone)]
pub struct TransformClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct TransformRequest<'a> {
    row: serde_json::Value,
    rules: &'a [TransformRule],
}

#[derive(Deserialize)]
struct TransformResponse {
    row: serde_json::Value,
}

impl TransformClient {
    pub fn new(endpoint: impl Into<String>) -> TransformClient {
        TransformClient {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Transform one row remotely. Network failures surface as `Transient`
    /// so coordinators retry with backoff.
    pub async fn transform(&self, row: &Row, rules: &[TransformRule]) -> Result<Row> {
        let request = TransformRequest {
            row: row_to_json(row),
            rules,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .timeout(Duration::from_secs(30))
            .json(&request)
            .send()
            .await
            .map_err(|err| Error::Transient(format!("transform service unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "transform service returned {}",
                response.status()
            )));
        }
        let body: TransformResponse = response
            .json()
            .await
            .map_err(|err| Error::Transient(format!("transform service payload: {err}")))?;
        Ok(row_from_json(body.row))
    }
}

/// Transform a row: remotely when rules are present and an endpoint is
/// configured, locally otherwise.
pub async fn transform_row(
    row: &Row,
    rules: &[TransformRule],
    endpoint: Option<&str>,
) -> Result<Row> {
    if rules.is_empty() {
        return Ok(row.clone());
    }
    match endpoint {
        Some(url) => TransformClient::new(url).transform(row, rules).await,
        None => Ok(apply_rules(row, rules)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(source: &str, target: &str, kind: TransformKind) -> TransformRule {
        TransformRule {
            source: source.into(),
            target: target.into(),
            kind,
        }
    }

    #[test]
    fn lowercase_rule_rewrites_value() {
        let mut row = Row::new();
        row.insert("k".into(), Value::String("V".into()));
        let out = apply_rules(&row, &[rule("k", "k", TransformKind::Lowercase)]);
        assert_eq!(out.get("k"), Some(&Value::String("v".into())));
    }

    #[test]
    fn rename_moves_the_field() {
        let mut row = Row::new();
        row.insert("a".into(), Value::Int(1));
        let out = apply_rules(&row, &[rule("a", "b", TransformKind::DirectMapping)]);
        assert!(out.get("a").is_none());
        assert_eq!(out.get("b"), Some(&Value::Int(1)));
    }

    #[test]
    fn unknown_kind_passes_through() {
        let mut row = Row::new();
        row.insert("k".into(), Value::String("x".into()));
        let out = apply_rules(&row, &[rule("k", "k", TransformKind::Other("rot13".into()))]);
        assert_eq!(out, row);
    }

    #[test]
    fn unknown_kind_deserializes_as_other() {
        let json = r#"{"source":"k","target":"k","transform":"rot13"}"#;
        let parsed: TransformRule = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, TransformKind::Other("rot13".into()));
        let builtin: TransformRule =
            serde_json::from_str(r#"{"source":"k","target":"k","transform":"uppercase"}"#).unwrap();
        assert_eq!(builtin.kind, TransformKind::Uppercase);
    }

    #[test]
    fn trim_only_touches_strings() {
        let mut row = Row::new();
        row.insert("n".into(), Value::Int(3));
        let out = apply_rules(&row, &[rule("n", "n", TransformKind::Trim)]);
        assert_eq!(out.get("n"), Some(&Value::Int(3)));
    }

    #[test]
    fn missing_source_field_is_skipped() {
        let row = Row::new();
        let out = apply_rules(&row, &[rule("absent", "absent", TransformKind::Trim)]);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn remote_transform_round_trip() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transform"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"row": {"k": "v"}})),
            )
            .mount(&server)
            .await;

        let mut row = Row::new();
        row.insert("k".into(), Value::String("V".into()));
        let rules = vec![rule("k", "k", TransformKind::Lowercase)];
        let out = transform_row(&row, &rules, Some(&format!("{}/transform", server.uri())))
            .await
            .unwrap();
        assert_eq!(out.get("k"), Some(&Value::String("v".into())));
    }

    #[tokio::test]
    async fn unreachable_transform_service_is_transient() {
        let mut row = Row::new();
        row.insert("k".into(), Value::String("x".into()));
        let rules = vec![rule("k", "k", TransformKind::Trim)];
        let err = transform_row(&row, &rules, Some("http://127.0.0.1:1/transform"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
