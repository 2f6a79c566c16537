//! Field values and their storage types.
//!
//! Rules compare fields against literal [`Value`]s. Before a literal is
//! compared it is dumped into the [`StorageType`] the schema declares for the
//! field, so that both the in-memory evaluator and the query compiler compare
//! the exact same representation.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// A field value of a resource
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value
    #[default]
    Null,
    /// A boolean
    Boolean(bool),
    /// A 64-bit signed integer
    Integer(i64),
    /// A floating point number
    Float(f64),
    /// A UTF-8 string
    String(String),
}

impl Value {
    /// Returns `true` if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the [`StorageType`] this value naturally belongs to, if any.
    pub fn storage_type(&self) -> Option<StorageType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(StorageType::Boolean),
            Value::Integer(_) => Some(StorageType::Integer),
            Value::Float(_) => Some(StorageType::Float),
            Value::String(_) => Some(StorageType::String),
        }
    }

    /// Orders two values of compatible types. Integers and floats compare
    /// numerically, `Null` sorts before everything else and values of
    /// unrelated types have no order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(value) => write!(f, "{value}"),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::String(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// The declared storage type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Stores [`Value::Boolean`]
    Boolean,
    /// Stores [`Value::Integer`]
    Integer,
    /// Stores [`Value::Float`]
    Float,
    /// Stores [`Value::String`]
    String,
}

impl StorageType {
    /// Dump `value` into this storage type.
    ///
    /// `Null` is accepted by every type, integers widen into floats and
    /// everything else must already be of the declared type.
    pub fn dump(&self, value: &Value) -> Result<Value, TypeError> {
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),
            (StorageType::Boolean, Value::Boolean(_))
            | (StorageType::Integer, Value::Integer(_))
            | (StorageType::Float, Value::Float(_))
            | (StorageType::String, Value::String(_)) => Ok(value.clone()),
            (StorageType::Float, Value::Integer(number)) => Ok(Value::Float(*number as f64)),
            _ => Err(TypeError::Mismatch {
                expected: *self,
                actual: value.clone(),
            }),
        }
    }
}

impl Display for StorageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageType::Boolean => "boolean",
            StorageType::Integer => "integer",
            StorageType::Float => "float",
            StorageType::String => "string",
        };
        write!(f, "{name}")
    }
}
