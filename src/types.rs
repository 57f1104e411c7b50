//! Core value types and the row codec.
//!
//! Supported types are deliberately narrow: `int32`, `int64`, `string`
//! (length-prefixed). A row is the concatenation of its fields' raw
//! encodings in declaration order.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Int64,
    String,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int32 => write!(f, "INT32"),
            DataType::Int64 => write!(f, "INT64"),
            DataType::String => write!(f, "STRING"),
        }
    }
}

impl DataType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "INT32" | "INT" => Some(DataType::Int32),
            "INT64" | "BIGINT" => Some(DataType::Int64),
            "STRING" | "VARCHAR" | "TEXT" => Some(DataType::String),
            _ => None,
        }
    }

    /// Zero value used to fill a column the INSERT list omitted.
    pub fn zero_value(&self) -> Value {
        match self {
            DataType::Int32 => Value::Int32(0),
            DataType::Int64 => Value::Int64(0),
            DataType::String => Value::String(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::String(_) => DataType::String,
        }
    }

    /// Numeric value used by the B+ tree index and range comparisons; only
    /// integer columns may be indexed.
    pub fn as_i64_key(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            Value::String(_) => None,
        }
    }

    /// Comparison used by WHERE/HAVING evaluation: numeric order when both
    /// sides are numbers, lexicographic otherwise.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self.as_i64_key(), other.as_i64_key()) {
            (Some(a), Some(b)) => Some(a.cmp(&b)),
            _ => match (self, other) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

/// A field (column) definition, as stored in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: DataType,
    /// uid of this field's B+ tree root pointer, if indexed.
    pub index_uid: Option<u64>,
    pub unique: bool,
    pub primary: bool,
}

impl Field {
    pub fn indexed(&self) -> bool {
        self.index_uid.is_some()
    }
}

pub type Row = HashMap<String, Value>;

/// Encode a row's fields in declaration order: fixed-width for ints,
/// length-prefixed (u32 big-endian) for strings.
pub fn encode_row(fields: &[Field], row: &Row) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for field in fields {
        let value = row
            .get(&field.name)
            .ok_or_else(|| DbError::InvalidValues(format!("missing value for {}", field.name)))?;
        match (field.ty, value) {
            (DataType::Int32, Value::Int32(i)) => buf.extend_from_slice(&i.to_be_bytes()),
            (DataType::Int64, Value::Int64(i)) => buf.extend_from_slice(&i.to_be_bytes()),
            (DataType::String, Value::String(s)) => {
                let bytes = s.as_bytes();
                buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            _ => {
                return Err(DbError::InvalidField(format!(
                    "type mismatch for field {}",
                    field.name
                )))
            }
        }
    }
    Ok(buf)
}

/// Decode a row encoded by [`encode_row`] back into a `name -> value` map.
pub fn decode_row(fields: &[Field], raw: &[u8]) -> Result<Row> {
    let mut row = Row::new();
    let mut pos = 0usize;
    for field in fields {
        match field.ty {
            DataType::Int32 => {
                let bytes: [u8; 4] = raw
                    .get(pos..pos + 4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| DbError::Internal("row decode: truncated int32".into()))?;
                row.insert(field.name.clone(), Value::Int32(i32::from_be_bytes(bytes)));
                pos += 4;
            }
            DataType::Int64 => {
                let bytes: [u8; 8] = raw
                    .get(pos..pos + 8)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| DbError::Internal("row decode: truncated int64".into()))?;
                row.insert(field.name.clone(), Value::Int64(i64::from_be_bytes(bytes)));
                pos += 8;
            }
            DataType::String => {
                let len_bytes: [u8; 4] = raw
                    .get(pos..pos + 4)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| DbError::Internal("row decode: truncated string len".into()))?;
                let len = u32::from_be_bytes(len_bytes) as usize;
                pos += 4;
                let bytes = raw
                    .get(pos..pos + len)
                    .ok_or_else(|| DbError::Internal("row decode: truncated string body".into()))?;
                row.insert(
                    field.name.clone(),
                    Value::String(String::from_utf8_lossy(bytes).into_owned()),
                );
                pos += len;
            }
        }
    }
    Ok(row)
}

/// The structured result a statement produces, JSON-encoded over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecResult {
    #[serde(rename = "OK")]
    Ok {
        message: String,
        affected_rows: u64,
        elapsed_ns: u128,
    },
    #[serde(rename = "RESULT")]
    Result {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        result_rows: u64,
        elapsed_ns: u128,
    },
}
