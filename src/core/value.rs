//! Database value types
//!
//! This module defines the values bound as statement arguments and read back
//! from result rows, the ordered [`DatabaseRow`], and the [`ColumnValue`]
//! conversion trait implemented by every type a record field may hold.

use crate::core::error::{DatabaseError, Result};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Formats accepted when a timestamp is stored as text
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Database value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatabaseValue {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit floating point
    Float(f32),
    /// 64-bit floating point
    Double(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Timestamp without time zone
    Timestamp(NaiveDateTime),
}

impl DatabaseValue {
    /// Get the value as a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DatabaseValue::Bool(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v != 0),
            DatabaseValue::Long(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Get the value as an i64
    pub fn as_long(&self) -> Option<i64> {
        match self {
            DatabaseValue::Long(v) => Some(*v),
            DatabaseValue::Int(v) => Some(*v as i64),
            DatabaseValue::Bool(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// Get the value as an f64
    pub fn as_double(&self) -> Option<f64> {
        match self {
            DatabaseValue::Double(v) => Some(*v),
            DatabaseValue::Float(v) => Some(*v as f64),
            DatabaseValue::Int(v) => Some(*v as f64),
            DatabaseValue::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Get the value as a string slice (zero-copy for String values)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Render the value for display and log output
    pub fn as_string(&self) -> String {
        match self {
            DatabaseValue::Null => "null".to_string(),
            DatabaseValue::Bool(v) => v.to_string(),
            DatabaseValue::Int(v) => v.to_string(),
            DatabaseValue::Long(v) => v.to_string(),
            DatabaseValue::Float(v) => v.to_string(),
            DatabaseValue::Double(v) => v.to_string(),
            DatabaseValue::String(s) => s.clone(),
            DatabaseValue::Bytes(b) => format!("<{} bytes>", b.len()),
            DatabaseValue::Timestamp(v) => v.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        }
    }

    /// Get the value as bytes (zero-copy)
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DatabaseValue::Bytes(b) => Some(b),
            DatabaseValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Whether the value equals the zero value of its type.
    ///
    /// Fields tagged `omitempty` are left out of write sets when this holds.
    pub fn is_zero(&self) -> bool {
        match self {
            DatabaseValue::Null => true,
            DatabaseValue::Bool(v) => !*v,
            DatabaseValue::Int(v) => *v == 0,
            DatabaseValue::Long(v) => *v == 0,
            DatabaseValue::Float(v) => *v == 0.0,
            DatabaseValue::Double(v) => *v == 0.0,
            DatabaseValue::String(s) => s.is_empty(),
            DatabaseValue::Bytes(b) => b.is_empty(),
            DatabaseValue::Timestamp(t) => *t == NaiveDateTime::default(),
        }
    }

    /// Get the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            DatabaseValue::Null => "null",
            DatabaseValue::Bool(_) => "bool",
            DatabaseValue::Int(_) => "int",
            DatabaseValue::Long(_) => "long",
            DatabaseValue::Float(_) => "float",
            DatabaseValue::Double(_) => "double",
            DatabaseValue::String(_) => "string",
            DatabaseValue::Bytes(_) => "bytes",
            DatabaseValue::Timestamp(_) => "timestamp",
        }
    }
}

impl std::fmt::Display for DatabaseValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<bool> for DatabaseValue {
    fn from(v: bool) -> Self {
        DatabaseValue::Bool(v)
    }
}

impl From<i32> for DatabaseValue {
    fn from(v: i32) -> Self {
        DatabaseValue::Int(v)
    }
}

impl From<i64> for DatabaseValue {
    fn from(v: i64) -> Self {
        DatabaseValue::Long(v)
    }
}

impl From<f32> for DatabaseValue {
    fn from(v: f32) -> Self {
        DatabaseValue::Float(v)
    }
}

impl From<f64> for DatabaseValue {
    fn from(v: f64) -> Self {
        DatabaseValue::Double(v)
    }
}

impl From<String> for DatabaseValue {
    fn from(v: String) -> Self {
        DatabaseValue::String(v)
    }
}

impl From<&str> for DatabaseValue {
    fn from(v: &str) -> Self {
        DatabaseValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for DatabaseValue {
    fn from(v: Vec<u8>) -> Self {
        DatabaseValue::Bytes(v)
    }
}

impl From<NaiveDateTime> for DatabaseValue {
    fn from(v: NaiveDateTime) -> Self {
        DatabaseValue::Timestamp(v)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DatabaseValue::Null,
        }
    }
}

/// Conversion between a Rust field type and a [`DatabaseValue`].
///
/// `from_value` is strict: it accepts the representations a backend actually
/// produces for the type and rejects everything else with `TypeMismatch`.
/// `Option<T>` is the nullable wrapper; every other implementation rejects
/// `NULL`.
pub trait ColumnValue: Sized + Send + Sync + 'static {
    /// Whether the type can represent SQL `NULL`
    const NULLABLE: bool = false;

    /// Encode into a statement argument
    fn to_value(&self) -> DatabaseValue;

    /// Decode from a row value
    fn from_value(value: DatabaseValue) -> Result<Self>;

    /// Zero-value test used by `omitempty`
    fn is_empty_value(&self) -> bool {
        self.to_value().is_zero()
    }
}

fn mismatch(expected: &str, value: &DatabaseValue) -> DatabaseError {
    DatabaseError::type_mismatch(expected, value.type_name())
}

impl ColumnValue for bool {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Bool(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Bool(v) => Ok(v),
            DatabaseValue::Int(0) | DatabaseValue::Long(0) => Ok(false),
            DatabaseValue::Int(1) | DatabaseValue::Long(1) => Ok(true),
            other => Err(mismatch("bool", &other)),
        }
    }
}

impl ColumnValue for i32 {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Int(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Int(v) => Ok(v),
            DatabaseValue::Long(v) => i32::try_from(v)
                .map_err(|_| DatabaseError::type_mismatch("i32", "out of range long")),
            other => Err(mismatch("i32", &other)),
        }
    }
}

impl ColumnValue for i64 {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Long(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Long(v) => Ok(v),
            DatabaseValue::Int(v) => Ok(v as i64),
            other => Err(mismatch("i64", &other)),
        }
    }
}

impl ColumnValue for f32 {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Float(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Float(v) => Ok(v),
            DatabaseValue::Double(v) => Ok(v as f32),
            DatabaseValue::Int(v) => Ok(v as f32),
            DatabaseValue::Long(v) => Ok(v as f32),
            other => Err(mismatch("f32", &other)),
        }
    }
}

impl ColumnValue for f64 {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Double(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Double(v) => Ok(v),
            DatabaseValue::Float(v) => Ok(v as f64),
            DatabaseValue::Int(v) => Ok(v as f64),
            DatabaseValue::Long(v) => Ok(v as f64),
            other => Err(mismatch("f64", &other)),
        }
    }
}

impl ColumnValue for String {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::String(self.clone())
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::String(v) => Ok(v),
            other => Err(mismatch("string", &other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl ColumnValue for Vec<u8> {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Bytes(self.clone())
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Bytes(v) => Ok(v),
            DatabaseValue::String(v) => Ok(v.into_bytes()),
            other => Err(mismatch("bytes", &other)),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_empty()
    }
}

impl ColumnValue for NaiveDateTime {
    fn to_value(&self) -> DatabaseValue {
        DatabaseValue::Timestamp(*self)
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Timestamp(v) => Ok(v),
            DatabaseValue::String(s) => TIMESTAMP_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&s, fmt).ok())
                .ok_or_else(|| DatabaseError::type_mismatch("timestamp", &format!("'{}'", s))),
            other => Err(mismatch("timestamp", &other)),
        }
    }
}

impl<T: ColumnValue> ColumnValue for Option<T> {
    const NULLABLE: bool = true;

    fn to_value(&self) -> DatabaseValue {
        match self {
            Some(v) => v.to_value(),
            None => DatabaseValue::Null,
        }
    }

    fn from_value(value: DatabaseValue) -> Result<Self> {
        match value {
            DatabaseValue::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }

    fn is_empty_value(&self) -> bool {
        self.is_none()
    }
}

/// A row of database results.
///
/// Columns keep the order the backend reported them in, and duplicate names
/// (common in join results) are preserved. Name lookup returns the first
/// occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRow {
    columns: Arc<[String]>,
    values: Vec<DatabaseValue>,
}

impl DatabaseRow {
    /// Build a row from shared column names and its values
    pub fn new(columns: Arc<[String]>, values: Vec<DatabaseValue>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in result order
    pub fn values(&self) -> &[DatabaseValue] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value of the first column with the given name
    pub fn get(&self, name: &str) -> Option<&DatabaseValue> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    /// Value at a column position
    pub fn get_index(&self, index: usize) -> Option<&DatabaseValue> {
        self.values.get(index)
    }

    /// Decode a named column into a typed value
    pub fn get_as<T: ColumnValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .cloned()
            .ok_or_else(|| DatabaseError::mapping("row", name, "no such column"))?;
        T::from_value(value).map_err(|e| DatabaseError::mapping("row", name, e.to_string()))
    }

    /// Iterate over `(column, value)` pairs in result order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatabaseValue)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Take ownership of the values
    pub fn into_values(self) -> Vec<DatabaseValue> {
        self.values
    }

    /// Collapse into a name-keyed map; the first duplicate wins
    pub fn to_map(&self) -> HashMap<String, DatabaseValue> {
        let mut map = HashMap::with_capacity(self.len());
        for (name, value) in self.iter() {
            map.entry(name.to_string()).or_insert_with(|| value.clone());
        }
        map
    }
}
