//! Engine-neutral schema representation.
//!
//! Every adapter projects its native catalog into a [`UnifiedModel`] and,
//! where supported, materializes one back into native DDL. The type
//! vocabulary is a small closed set; adapters map forward and reverse and
//! fall back to `string` on anything they do not recognize.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Closed vocabulary of column types carried across engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum UnifiedDataType {
    String,
    Integer,
    Bigint,
    Float,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Bytes,
    Numeric,
    Json,
    /// Engine-extension tag carried verbatim (e.g. `vector(384)`,
    /// `geography`). Reverse-mapped only by the engine that produced it.
    #[serde(untagged)]
    Extension(String),
}

impl UnifiedDataType {
    /// Map an arbitrary tag; unknown tags become [`UnifiedDataType::Extension`].
    pub fn from_tag(tag: &str) -> UnifiedDataType {
        UnifiedDataType::from_str(tag).unwrap_or_else(|_| UnifiedDataType::Extension(tag.to_string()))
    }
}

impl fmt::Display for UnifiedDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            UnifiedDataType::String => "string",
            UnifiedDataType::Integer => "integer",
            UnifiedDataType::Bigint => "bigint",
            UnifiedDataType::Float => "float",
            UnifiedDataType::Boolean => "boolean",
            UnifiedDataType::Timestamp => "timestamp",
            UnifiedDataType::Date => "date",
            UnifiedDataType::Time => "time",
            UnifiedDataType::Datetime => "datetime",
            UnifiedDataType::Bytes => "bytes",
            UnifiedDataType::Numeric => "numeric",
            UnifiedDataType::Json => "json",
            UnifiedDataType::Extension(tag) => tag,
        };
        f.write_str(tag)
    }
}

impl FromStr for UnifiedDataType {
    type Err = ();

    fn from_str(tag: &str) -> std::result::Result<Self, ()> {
        Ok(match tag {
            "string" => UnifiedDataType::String,
            "integer" => UnifiedDataType::Integer,
            "bigint" => UnifiedDataType::Bigint,
            "float" => UnifiedDataType::Float,
            "boolean" => UnifiedDataType::Boolean,
            "timestamp" => UnifiedDataType::Timestamp,
            "date" => UnifiedDataType::Date,
            "time" => UnifiedDataType::Time,
            "datetime" => UnifiedDataType::Datetime,
            "bytes" => UnifiedDataType::Bytes,
            "numeric" => UnifiedDataType::Numeric,
            "json" => UnifiedDataType::Json,
            _ => return Err(()),
        })
    }
}

/// One column of a table/collection projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: UnifiedDataType,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: UnifiedDataType) -> Column {
        Column {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default_value: None,
            options: BTreeMap::new(),
        }
    }

    pub fn primary_key(mut self) -> Column {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Column {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// A leaf data container: table, collection, index, prefix, datasource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    /// Ordered column set; order matters for engines that infer insert
    /// column lists from the first row.
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<Index>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Table {
        Table {
            name: name.into(),
            ..Table::default()
        }
    }

    pub fn with_column(mut self, column: Column) -> Table {
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub name: String,
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub return_type: Option<String>,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    pub name: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_increment")]
    pub increment: i64,
}

fn default_increment() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumDef {
    pub name: String,
    pub values: Vec<String>,
}

/// Object-store entry surfaced by schema discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blob {
    pub key: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Graph/OO class surfaced by schema discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeObject {
    pub name: String,
    #[serde(default)]
    pub properties: Vec<Column>,
}

/// Engine-neutral schema carrier.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedModel {
    /// Free-form label, usually the database name.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub views: BTreeMap<String, View>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub functions: BTreeMap<String, Function>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub triggers: BTreeMap<String, Trigger>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sequences: BTreeMap<String, Sequence>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub enums: BTreeMap<String, EnumDef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blobs: BTreeMap<String, Blob>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub type_objects: BTreeMap<String, TypeObject>,
}

impl UnifiedModel {
    pub fn new(label: impl Into<String>) -> UnifiedModel {
        UnifiedModel {
            label: label.into(),
            ..UnifiedModel::default()
        }
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
            && self.views.is_empty()
            && self.blobs.is_empty()
            && self.type_objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_tags_become_extensions() {
        let t = UnifiedDataType::from_tag("vector(384)");
        assert_eq!(t, UnifiedDataType::Extension("vector(384)".into()));
        assert_eq!(t.to_string(), "vector(384)");
    }

    #[test]
    fn closed_vocabulary_round_trips() {
        for tag in [
            "string", "integer", "bigint", "float", "boolean", "timestamp", "date", "time",
            "datetime", "bytes", "numeric", "json",
        ] {
            let t = UnifiedDataType::from_tag(tag);
            assert!(!matches!(t, UnifiedDataType::Extension(_)), "tag {tag}");
            assert_eq!(t.to_string(), tag);
        }
    }

    #[test]
    fn table_builder_tracks_primary_keys() {
        let table = Table::new("t")
            .with_column(Column::new("id", UnifiedDataType::Bigint).primary_key())
            .with_column(Column::new("name", UnifiedDataType::String));
        assert_eq!(table.primary_key_columns(), vec!["id"]);
        assert!(!table.column("id").unwrap().nullable);
    }

    #[test]
    fn model_serde_round_trip() {
        let mut model = UnifiedModel::new("app");
        model.add_table(
            Table::new("users").with_column(Column::new("id", UnifiedDataType::Bigint).primary_key()),
        );
        let json = serde_json::to_string(&model).unwrap();
        let back: UnifiedModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, model);
    }
}
