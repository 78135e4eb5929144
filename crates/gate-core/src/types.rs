// SPDX-License-Identifier: Apache-2.0

//! Universal data types for the gateway
//!
//! Names, values and rows as they travel between the policy layer, the
//! executor and the driver.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult, ViolationKind};

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("identifier pattern is a valid regex")
    })
}

/// Folds an unquoted identifier the way PostgreSQL does
pub fn normalize_identifier(ident: &str) -> String {
    ident.to_lowercase()
}

/// Validates a plain identifier from configuration or caller input and folds it
pub fn parse_identifier(raw: &str) -> GateResult<String> {
    let raw = raw.trim();
    if identifier_pattern().is_match(raw) {
        Ok(normalize_identifier(raw))
    } else {
        Err(GateError::invalid_argument(format!(
            "invalid identifier '{}'",
            raw
        )))
    }
}

/// A schema-qualified (or bare) table name
///
/// Identifiers are stored case-normalized; two names compare equal when the
/// database would resolve them to the same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedName {
    pub schema: Option<String>,
    pub table: String,
}

impl QualifiedName {
    /// Builds a name from identifiers that are already normalized
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }

    pub fn qualified(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::new(Some(schema.into()), table)
    }

    /// Parses `schema.table` or `table` from configuration or caller input
    ///
    /// Only plain identifiers are accepted; they are folded to lowercase.
    pub fn parse(raw: &str) -> GateResult<Self> {
        let raw = raw.trim();
        let mut parts = raw.split('.');
        let (schema, table) = match (parts.next(), parts.next(), parts.next()) {
            (Some(table), None, None) => (None, table),
            (Some(schema), Some(table), None) => (Some(schema), table),
            _ => {
                return Err(GateError::invalid_argument(format!(
                    "invalid table name '{}': expected 'schema.table' or 'table'",
                    raw
                )))
            }
        };

        Ok(Self {
            schema: schema.map(parse_identifier).transpose()?,
            table: parse_identifier(table)?,
        })
    }

    /// Fills in the schema of an unqualified name
    ///
    /// Names with the reserved `pg_` prefix resolve to the system catalog,
    /// which PostgreSQL always searches first.
    pub fn resolve(&self, default_schema: &str) -> Self {
        match self.schema {
            Some(_) => self.clone(),
            None if self.table.starts_with("pg_") => {
                Self::qualified("pg_catalog", self.table.clone())
            }
            None => Self::qualified(default_schema, self.table.clone()),
        }
    }

    pub fn is_qualified(&self) -> bool {
        self.schema.is_some()
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => write!(f, "{}", self.table),
        }
    }
}

/// Outcome of the statement classifier and the scope enforcer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassificationVerdict {
    Allowed,
    Rejected(ViolationKind),
}

impl ClassificationVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Converts into a result so `?` can short-circuit a rejection
    pub fn into_result(self) -> Result<(), ViolationKind> {
        match self {
            Self::Allowed => Ok(()),
            Self::Rejected(violation) => Err(violation),
        }
    }
}

/// Universal value representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    /// Converts a JSON parameter into a bindable scalar
    ///
    /// Arrays and objects are not scalars and are refused.
    pub fn from_param(param: serde_json::Value) -> GateResult<Self> {
        match param {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .ok_or_else(|| {
                    GateError::invalid_argument(format!("unsupported numeric parameter {}", n))
                }),
            serde_json::Value::String(s) => Ok(Self::Text(s)),
            other => Err(GateError::invalid_argument(format!(
                "parameters must be scalars or null, got {}",
                other
            ))),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// A caller's query with its positional parameters
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub text: String,
    pub parameters: Vec<Value>,
}

impl RawRequest {
    pub fn new(text: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            text: text.into(),
            parameters,
        }
    }
}

/// Column metadata of a result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// A single row of data (indexed by column order)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

/// Column metadata for table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub column_name: String,
    pub data_type: String,
    #[serde(rename = "character_maximum_length")]
    pub max_length: Option<i32>,
    pub nullable: bool,
    pub default: Option<String>,
}

/// Rows pulled from a driver under a fetch limit
#[derive(Debug, Clone, Default)]
pub struct FetchedRows {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
    /// True when the driver saw the end of the result set
    pub exhausted: bool,
}

/// Handle used to cancel the statement running on one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CancelToken {
    pub backend_id: i64,
}
