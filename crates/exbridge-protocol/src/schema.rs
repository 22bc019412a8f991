//! Column schema negotiation
//!
//! The schema frame carries UTF-8 JSON of the form
//! `{"columns": [{"name": "...", "type": "INTEGER"}, ...]}`.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use exbridge_common::{BridgeError, Result};
use serde::{Deserialize, Serialize};

/// Wire-level column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Integer,
    BigInt,
    Double,
    Varchar,
}

impl LogicalType {
    /// Case-sensitive match on the tag sent by the export client.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "INTEGER" => Some(LogicalType::Integer),
            "BIGINT" => Some(LogicalType::BigInt),
            "DOUBLE" => Some(LogicalType::Double),
            "VARCHAR" => Some(LogicalType::Varchar),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            LogicalType::Integer => "INTEGER",
            LogicalType::BigInt => "BIGINT",
            LogicalType::Double => "DOUBLE",
            LogicalType::Varchar => "VARCHAR",
        }
    }

    pub fn data_type(self) -> DataType {
        match self {
            LogicalType::Integer => DataType::Int32,
            LogicalType::BigInt => DataType::Int64,
            LogicalType::Double => DataType::Float64,
            LogicalType::Varchar => DataType::Utf8,
        }
    }
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// What to do with a type tag we do not recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypePolicy {
    /// Read the column as VARCHAR.
    #[default]
    Permissive,
    /// Fail negotiation with `UnsupportedType`.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub logical_type: LogicalType,
    /// Tag as sent by the client, kept for logging when it was remapped.
    pub declared_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            declared_type: logical_type.tag().to_string(),
        }
    }

    pub fn is_remapped(&self) -> bool {
        self.declared_type != self.logical_type.tag()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaMessage {
    columns: Vec<ColumnMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ColumnMessage {
    name: String,
    #[serde(rename = "type")]
    type_tag: String,
}

/// Ordered, immutable column layout of one session
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    columns: Vec<ColumnDef>,
    arrow_schema: SchemaRef,
}

impl ColumnSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(&c.name, c.logical_type.data_type(), true))
            .collect();
        Self {
            columns,
            arrow_schema: Arc::new(Schema::new(fields)),
        }
    }

    /// Parse the schema frame payload.
    pub fn parse(payload: &[u8], policy: TypePolicy) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| BridgeError::SchemaParse(format!("schema is not UTF-8: {e}")))?;
        let message: SchemaMessage = serde_json::from_str(text)
            .map_err(|e| BridgeError::SchemaParse(format!("invalid schema JSON: {e}")))?;

        let mut columns = Vec::with_capacity(message.columns.len());
        for col in message.columns {
            let logical_type = match (LogicalType::from_tag(&col.type_tag), policy) {
                (Some(t), _) => t,
                (None, TypePolicy::Permissive) => LogicalType::Varchar,
                (None, TypePolicy::Strict) => {
                    return Err(BridgeError::UnsupportedType(format!(
                        "column '{}' has type '{}'",
                        col.name, col.type_tag
                    )));
                }
            };
            columns.push(ColumnDef {
                name: col.name,
                logical_type,
                declared_type: col.type_tag,
            });
        }
        Ok(Self::new(columns))
    }

    /// JSON text as the export client would send it.
    pub fn to_json(&self) -> String {
        let message = SchemaMessage {
            columns: self
                .columns
                .iter()
                .map(|c| ColumnMessage {
                    name: c.name.clone(),
                    type_tag: c.declared_type.clone(),
                })
                .collect(),
        };
        // A struct of strings always serializes.
        serde_json::to_string(&message).unwrap_or_default()
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        self.arrow_schema.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        let json = br#"{"columns":[
            {"name":"id","type":"INTEGER"},
            {"name":"big","type":"BIGINT"},
            {"name":"d","type":"DOUBLE"},
            {"name":"v","type":"VARCHAR"}]}"#;
        let schema = ColumnSchema::parse(json, TypePolicy::Permissive).unwrap();

        let types: Vec<_> = schema.columns().iter().map(|c| c.logical_type).collect();
        assert_eq!(
            types,
            vec![
                LogicalType::Integer,
                LogicalType::BigInt,
                LogicalType::Double,
                LogicalType::Varchar
            ]
        );

        let arrow = schema.arrow_schema();
        assert_eq!(arrow.fields().len(), 4);
        assert_eq!(arrow.field(0).name(), "id");
        assert_eq!(arrow.field(0).data_type(), &DataType::Int32);
        assert_eq!(arrow.field(2).data_type(), &DataType::Float64);
        assert!(arrow.field(3).is_nullable());
    }

    #[test]
    fn test_unknown_type_defaults_to_varchar() {
        let json = br#"{"columns":[{"name":"d","type":"DATE"},{"name":"x","type":"integer"}]}"#;
        let schema = ColumnSchema::parse(json, TypePolicy::Permissive).unwrap();

        assert_eq!(schema.columns()[0].logical_type, LogicalType::Varchar);
        assert_eq!(schema.columns()[0].declared_type, "DATE");
        assert!(schema.columns()[0].is_remapped());
        // tags are case-sensitive
        assert_eq!(schema.columns()[1].logical_type, LogicalType::Varchar);
        assert_eq!(schema.arrow_schema().field(0).data_type(), &DataType::Utf8);
    }

    #[test]
    fn test_strict_policy_rejects_unknown_type() {
        let json = br#"{"columns":[{"name":"d","type":"DATE"}]}"#;
        assert!(matches!(
            ColumnSchema::parse(json, TypePolicy::Strict),
            Err(BridgeError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_malformed_schema() {
        assert!(matches!(
            ColumnSchema::parse(b"not json", TypePolicy::Permissive),
            Err(BridgeError::SchemaParse(_))
        ));
        assert!(matches!(
            ColumnSchema::parse(br#"{"cols":[]}"#, TypePolicy::Permissive),
            Err(BridgeError::SchemaParse(_))
        ));
        assert!(matches!(
            ColumnSchema::parse(&[0xff, 0xfe], TypePolicy::Permissive),
            Err(BridgeError::SchemaParse(_))
        ));
    }

    #[test]
    fn test_extra_fields_ignored_and_json_regenerated() {
        let json = br#"{"version":2,"columns":[{"name":"id","type":"BIGINT","nullable":true}]}"#;
        let schema = ColumnSchema::parse(json, TypePolicy::Permissive).unwrap();
        assert_eq!(schema.len(), 1);
        assert_eq!(schema.to_json(), r#"{"columns":[{"name":"id","type":"BIGINT"}]}"#);
    }
}
