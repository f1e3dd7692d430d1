//! Row and Value Model
//!
//! Rows are dynamically shaped: a map from column name to a tagged [`Value`].
//! Table schemas (when present) carry per-column [`DataType`]s and are
//! enforced at insert time; tables created without column definitions accept
//! any column set.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SerengetiError, SerengetiResult};

/// Column data types understood by the DDL surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int,
    Float,
    Varchar,
    Bool,
    Timestamp,
    Blob,
}

impl DataType {
    /// Parses a column type keyword from DDL. Accepts the common aliases.
    pub fn parse(keyword: &str) -> Option<DataType> {
        match keyword.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" | "BIGINT" => Some(DataType::Int),
            "FLOAT" | "DOUBLE" | "REAL" => Some(DataType::Float),
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" => Some(DataType::Varchar),
            "BOOL" | "BOOLEAN" => Some(DataType::Bool),
            "TIMESTAMP" | "DATETIME" => Some(DataType::Timestamp),
            "BLOB" | "BYTES" | "BINARY" => Some(DataType::Blob),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "INT",
            DataType::Float => "FLOAT",
            DataType::Varchar => "VARCHAR",
            DataType::Bool => "BOOL",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Blob => "BLOB",
        };
        f.write_str(name)
    }
}

/// Tagged value union for row columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Blob(Vec<u8>),
    Null,
}

/// A materialized row as seen by the query engine.
pub type RowData = HashMap<String, Value>;

impl Value {
    /// Converts a JSON value coming off the wire into a tagged value.
    /// Integers map to `Int`, other numbers to `Float`; `Timestamp` and
    /// `Blob` are only produced by schema coercion.
    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        }
    }

    /// Converts a tagged value back to plain JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::json!(i),
            Value::Float(f) => serde_json::json!(f),
            Value::Str(s) => serde_json::json!(s),
            Value::Bool(b) => serde_json::json!(b),
            Value::Timestamp(ts) => serde_json::json!(ts),
            Value::Blob(bytes) => {
                // Blobs travel as hex strings on the JSON wire.
                let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                serde_json::json!(hex)
            }
            Value::Null => serde_json::Value::Null,
        }
    }

    /// Coerces this value to the given column type, or rejects it.
    pub fn coerce(&self, data_type: DataType) -> SerengetiResult<Value> {
        let coerced = match (data_type, self) {
            (DataType::Int, Value::Int(i)) => Value::Int(*i),
            (DataType::Int, Value::Float(f)) if f.fract() == 0.0 => Value::Int(*f as i64),
            (DataType::Float, Value::Float(f)) => Value::Float(*f),
            (DataType::Float, Value::Int(i)) => Value::Float(*i as f64),
            (DataType::Varchar, Value::Str(s)) => Value::Str(s.clone()),
            (DataType::Bool, Value::Bool(b)) => Value::Bool(*b),
            (DataType::Timestamp, Value::Int(i)) => Value::Timestamp(*i),
            (DataType::Timestamp, Value::Timestamp(ts)) => Value::Timestamp(*ts),
            (DataType::Blob, Value::Str(hex)) => {
                let bytes = decode_hex(hex).ok_or_else(|| {
                    SerengetiError::parse(format!("invalid hex blob literal '{hex}'"))
                })?;
                Value::Blob(bytes)
            }
            (DataType::Blob, Value::Blob(bytes)) => Value::Blob(bytes.clone()),
            (_, Value::Null) => Value::Null,
            (expected, actual) => {
                return Err(SerengetiError::parse(format!(
                    "type mismatch: expected {expected}, got {}",
                    actual.type_name()
                )))
            }
        };
        Ok(coerced)
    }

    /// Human-readable tag name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Timestamp(_) => "timestamp",
            Value::Blob(_) => "blob",
            Value::Null => "null",
        }
    }

    /// Cross-type comparison used by WHERE predicates, ORDER BY and indexes.
    /// Numeric variants compare by magnitude; other types only compare within
    /// their own tag. `None` means the pair is not comparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Timestamp(b)) | (Value::Timestamp(a), Value::Int(b)) => {
                Some(a.cmp(b))
            }
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// String rendering used by LIKE / CONTAINS / REGEX / FUZZY operators.
    pub fn as_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

/// Totally ordered wrapper over [`Value`], for BTreeMap index keys and group
/// keys. Incomparable tags order by tag rank so the ordering is still total.
#[derive(Debug, Clone, PartialEq)]
pub struct OrdValue(pub Value);

impl Eq for OrdValue {}

impl PartialOrd for OrdValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdValue {
    fn cmp(&self, other: &Self) -> Ordering {
        if let Some(ord) = self.0.compare(&other.0) {
            return ord;
        }
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int(_) | Value::Float(_) | Value::Timestamp(_) => 2,
                Value::Str(_) => 3,
                Value::Blob(_) => 4,
            }
        }
        rank(&self.0).cmp(&rank(&other.0))
    }
}

impl std::hash::Hash for OrdValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Int(i) => i.hash(state),
            // Numeric values that compare equal must hash equal.
            Value::Float(f) => {
                if f.fract() == 0.0 && f.is_finite() {
                    (*f as i64).hash(state)
                } else {
                    f.to_bits().hash(state)
                }
            }
            Value::Timestamp(ts) => ts.hash(state),
            Value::Str(s) => s.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Blob(bytes) => bytes.hash(state),
            Value::Null => 0u8.hash(state),
        }
    }
}

/// Converts a JSON object into a typed row map.
pub fn row_from_json(json: &serde_json::Value) -> SerengetiResult<RowData> {
    let object = json.as_object().ok_or_else(|| {
        SerengetiError::parse(format!("row payload must be a JSON object, got {json}"))
    })?;
    Ok(object
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json(v)))
        .collect())
}

/// Converts a typed row map back into a JSON object.
pub fn row_to_json(row: &RowData) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> =
        row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
    serde_json::Value::Object(map)
}

/// Stable textual form of a row id, used as the LSM key.
pub fn row_key(row_id: Uuid) -> Vec<u8> {
    row_id.to_string().into_bytes()
}

fn decode_hex(input: &str) -> Option<Vec<u8>> {
    if input.len() % 2 != 0 {
        return None;
    }
    (0..input.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&input[i..i + 2], 16).ok())
        .collect()
}
