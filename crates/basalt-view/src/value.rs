//! Typed column values.

use std::cmp::Ordering;
use std::fmt::{self, Display};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Column data types supported by base tables and views.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    BigInt,
    Text,
    Blob,
    Boolean,
    Counter,
    List(Box<DataType>),
}

impl DataType {
    /// Counter and list columns cannot be key components.
    pub fn can_be_key(&self) -> bool {
        !matches!(self, DataType::Counter | DataType::List(_))
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int => write!(f, "int"),
            DataType::BigInt => write!(f, "bigint"),
            DataType::Text => write!(f, "text"),
            DataType::Blob => write!(f, "blob"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::Counter => write!(f, "counter"),
            DataType::List(inner) => write!(f, "list<{inner}>"),
        }
    }
}

/// A non-null column value.
///
/// Null is modelled as the absence of a live cell, never as a variant here.
/// The derived ordering compares values of the same variant naturally, which
/// is what key ordering needs; values of different variants never meet in a
/// well-typed column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i32),
    BigInt(i64),
    Text(String),
    Blob(Bytes),
    Boolean(bool),
    Counter(i64),
    List(Vec<Value>),
}

impl Value {
    /// The zero-width payload carried by internal liveness cells.
    pub fn empty() -> Self {
        Value::Blob(Bytes::new())
    }

    /// Number of bytes this value occupies when serialized as a key
    /// component.
    pub fn serialized_size(&self) -> usize {
        match self {
            Value::Int(_) => 4,
            Value::BigInt(_) | Value::Counter(_) => 8,
            Value::Boolean(_) => 1,
            Value::Text(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::List(items) => items.iter().map(|v| 4 + v.serialized_size()).sum(),
        }
    }

    /// Returns true if this value can be stored in a column of `data_type`.
    pub fn is_compatible_with(&self, data_type: &DataType) -> bool {
        match (self, data_type) {
            (Value::Int(_), DataType::Int)
            | (Value::BigInt(_), DataType::BigInt)
            | (Value::Text(_), DataType::Text)
            | (Value::Blob(_), DataType::Blob)
            | (Value::Boolean(_), DataType::Boolean)
            | (Value::Counter(_), DataType::Counter) => true,
            (Value::List(items), DataType::List(inner)) => {
                items.iter().all(|v| v.is_compatible_with(inner))
            }
            _ => false,
        }
    }

    /// Compares two values for filtering. Returns `None` when the values are
    /// not comparable (different types).
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::BigInt(a), Value::BigInt(b)) | (Value::Counter(a), Value::Counter(b)) => {
                Some(a.cmp(b))
            }
            (Value::Int(a), Value::BigInt(b)) => Some(i64::from(*a).cmp(b)),
            (Value::BigInt(a), Value::Int(b)) => Some(a.cmp(&i64::from(*b))),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Blob(a), Value::Blob(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::List(a), Value::List(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) | Value::Counter(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::BigInt(v) | Value::Counter(v) => write!(f, "{v}"),
            Value::Text(s) => write!(f, "'{s}'"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Blob(v)
    }
}
