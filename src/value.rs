//! Field values and field types
//!
//! Every persisted leaf holds one [`Value`]. Scalars map onto SQLite storage
//! classes directly; arrays are stored as JSON text and timestamps as RFC 3339
//! text with nanosecond precision so that text ordering matches time ordering.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::lob::LargeObject;
use crate::{Error, Result};

/// Scalar element types a leaf column may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    Int,
    Long,
    Float,
    Double,
    Text,
    Bytes,
    Timestamp,
}

impl ScalarType {
    /// Get the string representation of the scalar type
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
            ScalarType::Text => "text",
            ScalarType::Bytes => "bytes",
            ScalarType::Timestamp => "timestamp",
        }
    }

    /// Whether arrays of this scalar are on the allow-list.
    pub fn allowed_in_array(&self) -> bool {
        matches!(
            self,
            ScalarType::Bool
                | ScalarType::Int
                | ScalarType::Long
                | ScalarType::Float
                | ScalarType::Double
                | ScalarType::Text
        )
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared type of a leaf column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Scalar(ScalarType),
    Array(ScalarType),
}

impl FieldType {
    pub const BOOL: FieldType = FieldType::Scalar(ScalarType::Bool);
    pub const INT: FieldType = FieldType::Scalar(ScalarType::Int);
    pub const LONG: FieldType = FieldType::Scalar(ScalarType::Long);
    pub const FLOAT: FieldType = FieldType::Scalar(ScalarType::Float);
    pub const DOUBLE: FieldType = FieldType::Scalar(ScalarType::Double);
    pub const TEXT: FieldType = FieldType::Scalar(ScalarType::Text);
    pub const BYTES: FieldType = FieldType::Scalar(ScalarType::Bytes);
    pub const TIMESTAMP: FieldType = FieldType::Scalar(ScalarType::Timestamp);

    /// Check the type against the allow-list
    pub fn is_supported(&self) -> bool {
        match self {
            FieldType::Scalar(_) => true,
            FieldType::Array(elem) => elem.allowed_in_array(),
        }
    }

    /// SQL column type used in DDL
    pub fn sql_type(&self, max_length: Option<u32>) -> String {
        match self {
            FieldType::Scalar(ScalarType::Bool)
            | FieldType::Scalar(ScalarType::Int)
            | FieldType::Scalar(ScalarType::Long) => "INTEGER".to_string(),
            FieldType::Scalar(ScalarType::Float) | FieldType::Scalar(ScalarType::Double) => {
                "REAL".to_string()
            }
            FieldType::Scalar(ScalarType::Text) => match max_length {
                Some(n) => format!("VARCHAR({})", n),
                None => "TEXT".to_string(),
            },
            FieldType::Scalar(ScalarType::Bytes) => "BLOB".to_string(),
            FieldType::Scalar(ScalarType::Timestamp) | FieldType::Array(_) => "TEXT".to_string(),
        }
    }

    /// SQL literal used as the default of a NOT NULL column, so that bare
    /// inserts succeed.
    pub fn zero_default(&self) -> &'static str {
        match self {
            FieldType::Scalar(ScalarType::Bool)
            | FieldType::Scalar(ScalarType::Int)
            | FieldType::Scalar(ScalarType::Long) => "0",
            FieldType::Scalar(ScalarType::Float) | FieldType::Scalar(ScalarType::Double) => "0.0",
            FieldType::Scalar(ScalarType::Text) => "''",
            FieldType::Scalar(ScalarType::Bytes) => "X''",
            FieldType::Scalar(ScalarType::Timestamp) => "'1970-01-01T00:00:00.000000000Z'",
            FieldType::Array(_) => "'[]'",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Scalar(s) => write!(f, "{}", s),
            FieldType::Array(s) => write!(f, "{}[]", s),
        }
    }
}

/// Typed array payload of an array column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArrayValue {
    Bool(Vec<bool>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    Text(Vec<String>),
}

impl ArrayValue {
    pub fn element_type(&self) -> ScalarType {
        match self {
            ArrayValue::Bool(_) => ScalarType::Bool,
            ArrayValue::Int(_) => ScalarType::Int,
            ArrayValue::Long(_) => ScalarType::Long,
            ArrayValue::Float(_) => ScalarType::Float,
            ArrayValue::Double(_) => ScalarType::Double,
            ArrayValue::Text(_) => ScalarType::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bool(v) => v.len(),
            ArrayValue::Int(v) => v.len(),
            ArrayValue::Long(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
            ArrayValue::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_non_finite(&self) -> bool {
        match self {
            ArrayValue::Float(v) => v.iter().any(|x| !x.is_finite()),
            ArrayValue::Double(v) => v.iter().any(|x| !x.is_finite()),
            _ => false,
        }
    }

    fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn from_json(elem: ScalarType, text: &str) -> std::result::Result<Self, serde_json::Error> {
        Ok(match elem {
            ScalarType::Bool => ArrayValue::Bool(serde_json::from_str(text)?),
            ScalarType::Int => ArrayValue::Int(serde_json::from_str(text)?),
            ScalarType::Long => ArrayValue::Long(serde_json::from_str(text)?),
            ScalarType::Float => ArrayValue::Float(serde_json::from_str(text)?),
            ScalarType::Double => ArrayValue::Double(serde_json::from_str(text)?),
            // Allow-list keeps the remaining scalars out of arrays.
            _ => ArrayValue::Text(serde_json::from_str(text)?),
        })
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Array(ArrayValue),
    Lob(LargeObject),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's type, used in mismatch errors
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Long(_) => "long".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Double(_) => "double".to_string(),
            Value::Text(_) => "text".to_string(),
            Value::Bytes(_) => "bytes".to_string(),
            Value::Timestamp(_) => "timestamp".to_string(),
            Value::Array(a) => format!("{}[]", a.element_type()),
            Value::Lob(_) => "lob".to_string(),
        }
    }

    /// Integer view used for ids and foreign keys
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Check the value against a column type, widening Int→Long and Float→Double.
    pub(crate) fn coerce(self, column: &str, ty: FieldType) -> Result<Value> {
        let mismatch = |found: &Value| Error::TypeMismatch {
            column: column.to_string(),
            expected: ty.to_string(),
            found: found.type_name(),
        };
        let non_finite = || Error::TypeMismatch {
            column: column.to_string(),
            expected: format!("finite {}", ty),
            found: "NaN or infinity".to_string(),
        };
        match (ty, self) {
            (_, Value::Null) => Ok(Value::Null),
            (FieldType::Scalar(ScalarType::Float | ScalarType::Double), Value::Float(v)) if !v.is_finite() => {
                Err(non_finite())
            }
            (FieldType::Scalar(ScalarType::Double), Value::Double(v)) if !v.is_finite() => Err(non_finite()),
            (FieldType::Scalar(ScalarType::Bool), v @ Value::Bool(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Int), v @ Value::Int(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Long), v @ Value::Long(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Long), Value::Int(v)) => Ok(Value::Long(i64::from(v))),
            (FieldType::Scalar(ScalarType::Float), v @ Value::Float(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Double), v @ Value::Double(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Double), Value::Float(v)) => Ok(Value::Double(f64::from(v))),
            (FieldType::Scalar(ScalarType::Text), v @ Value::Text(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Bytes), v @ Value::Bytes(_)) => Ok(v),
            (FieldType::Scalar(ScalarType::Timestamp), v @ Value::Timestamp(_)) => Ok(v),
            (FieldType::Array(elem), Value::Array(a)) if a.element_type() == elem => {
                if a.has_non_finite() {
                    return Err(Error::TypeMismatch {
                        column: column.to_string(),
                        expected: "finite array elements".to_string(),
                        found: "NaN or infinity".to_string(),
                    });
                }
                Ok(Value::Array(a))
            }
            (_, other) => Err(mismatch(&other)),
        }
    }

    /// Encode for binding as a statement parameter.
    pub(crate) fn to_sql(&self) -> Result<SqlValue> {
        Ok(match self {
            Value::Null => SqlValue::Null,
            Value::Bool(v) => SqlValue::Integer(i64::from(*v)),
            Value::Int(v) => SqlValue::Integer(i64::from(*v)),
            Value::Long(v) => SqlValue::Integer(*v),
            Value::Float(v) => SqlValue::Real(f64::from(*v)),
            Value::Double(v) => SqlValue::Real(*v),
            Value::Text(v) => SqlValue::Text(v.clone()),
            Value::Bytes(v) => SqlValue::Blob(v.clone()),
            Value::Timestamp(v) => SqlValue::Text(v.to_rfc3339_opts(SecondsFormat::Nanos, true)),
            Value::Array(a) => SqlValue::Text(a.to_json().map_err(|e| {
                Error::Storage(StorageError::Decode {
                    column: "array".to_string(),
                    reason: e.to_string(),
                })
            })?),
            Value::Lob(lob) => SqlValue::Integer(lob.id().as_i64()),
        })
    }

    /// Decode a stored leaf value of the given type.
    pub(crate) fn from_sql(column: &str, ty: FieldType, raw: SqlValue) -> Result<Value> {
        let decode_err = |reason: String| {
            Error::Storage(StorageError::Decode {
                column: column.to_string(),
                reason,
            })
        };
        let value = match (ty, raw) {
            (_, SqlValue::Null) => Value::Null,
            (FieldType::Scalar(ScalarType::Bool), SqlValue::Integer(v)) => Value::Bool(v != 0),
            (FieldType::Scalar(ScalarType::Int), SqlValue::Integer(v)) => Value::Int(
                i32::try_from(v).map_err(|_| decode_err(format!("{} does not fit in int", v)))?,
            ),
            (FieldType::Scalar(ScalarType::Long), SqlValue::Integer(v)) => Value::Long(v),
            (FieldType::Scalar(ScalarType::Float), SqlValue::Real(v)) => Value::Float(v as f32),
            (FieldType::Scalar(ScalarType::Float), SqlValue::Integer(v)) => Value::Float(v as f32),
            (FieldType::Scalar(ScalarType::Double), SqlValue::Real(v)) => Value::Double(v),
            (FieldType::Scalar(ScalarType::Double), SqlValue::Integer(v)) => Value::Double(v as f64),
            (FieldType::Scalar(ScalarType::Text), SqlValue::Text(v)) => Value::Text(v),
            (FieldType::Scalar(ScalarType::Bytes), SqlValue::Blob(v)) => Value::Bytes(v),
            (FieldType::Scalar(ScalarType::Timestamp), SqlValue::Text(v)) => Value::Timestamp(
                DateTime::parse_from_rfc3339(&v)
                    .map_err(|e| decode_err(e.to_string()))?
                    .with_timezone(&Utc),
            ),
            (FieldType::Array(elem), SqlValue::Text(v)) => {
                Value::Array(ArrayValue::from_json(elem, &v).map_err(|e| decode_err(e.to_string()))?)
            }
            (ty, other) => {
                return Err(decode_err(format!(
                    "expected {}, found {:?}",
                    ty,
                    other.data_type()
                )))
            }
        };
        Ok(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Array(a) => write!(f, "<{} x {}>", a.len(), a.element_type()),
            Value::Lob(lob) => write!(f, "lob:{}", lob.id()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Text,
    Vec<u8> => Bytes,
    DateTime<Utc> => Timestamp,
    ArrayValue => Array,
    LargeObject => Lob,
}

macro_rules! array_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<Vec<$ty>> for Value {
                fn from(v: Vec<$ty>) -> Self {
                    Value::Array(ArrayValue::$variant(v))
                }
            }
        )*
    };
}

array_from! {
    bool => Bool,
    i32 => Int,
    i64 => Long,
    f32 => Float,
    f64 => Double,
    String => Text,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<&LargeObject> for Value {
    fn from(v: &LargeObject) -> Self {
        Value::Lob(v.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Conversion out of a [`Value`] for typed reads.
pub trait FromValue: Sized {
    fn from_value(column: &str, value: Value) -> Result<Self>;
}

fn mismatch(column: &str, expected: &str, found: &Value) -> Error {
    Error::TypeMismatch {
        column: column.to_string(),
        expected: expected.to_string(),
        found: found.type_name(),
    }
}

macro_rules! from_value {
    ($($ty:ty => $name:literal, $pat:pat => $out:expr),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(column: &str, value: Value) -> Result<Self> {
                    match value {
                        $pat => Ok($out),
                        other => Err(mismatch(column, $name, &other)),
                    }
                }
            }
        )*
    };
}

from_value! {
    bool => "bool", Value::Bool(v) => v,
    i32 => "int", Value::Int(v) => v,
    f32 => "float", Value::Float(v) => v,
    String => "text", Value::Text(v) => v,
    Vec<u8> => "bytes", Value::Bytes(v) => v,
    DateTime<Utc> => "timestamp", Value::Timestamp(v) => v,
    LargeObject => "lob", Value::Lob(v) => v,
    ArrayValue => "array", Value::Array(v) => v,
    Vec<bool> => "bool[]", Value::Array(ArrayValue::Bool(v)) => v,
    Vec<i32> => "int[]", Value::Array(ArrayValue::Int(v)) => v,
    Vec<i64> => "long[]", Value::Array(ArrayValue::Long(v)) => v,
    Vec<f32> => "float[]", Value::Array(ArrayValue::Float(v)) => v,
    Vec<f64> => "double[]", Value::Array(ArrayValue::Double(v)) => v,
    Vec<String> => "text[]", Value::Array(ArrayValue::Text(v)) => v,
}

impl FromValue for i64 {
    fn from_value(column: &str, value: Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch(column, "long", &value))
    }
}

impl FromValue for f64 {
    fn from_value(column: &str, value: Value) -> Result<Self> {
        match value {
            Value::Double(v) => Ok(v),
            Value::Float(v) => Ok(f64::from(v)),
            other => Err(mismatch(column, "double", &other)),
        }
    }
}

impl FromValue for Value {
    fn from_value(_column: &str, value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(column: &str, value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(column, other).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_widens_into_long_column() {
        let v = Value::Int(7).coerce("weight", FieldType::LONG).unwrap();
        assert_eq!(v, Value::Long(7));
    }

    #[test]
    fn test_coerce_rejects_wrong_type() {
        let err = Value::Text("x".into()).coerce("weight", FieldType::INT).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_array_element_type_must_match() {
        let arr = Value::from(vec![1i64, 2, 3]);
        assert!(arr.clone().coerce("a", FieldType::Array(ScalarType::Long)).is_ok());
        assert!(arr.coerce("a", FieldType::Array(ScalarType::Int)).is_err());
    }

    #[test]
    fn test_array_allow_list() {
        assert!(FieldType::Array(ScalarType::Text).is_supported());
        assert!(!FieldType::Array(ScalarType::Bytes).is_supported());
        assert!(!FieldType::Array(ScalarType::Timestamp).is_supported());
    }

    #[test]
    fn test_timestamp_text_keeps_nanoseconds() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T10:20:30.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let raw = Value::Timestamp(ts).to_sql().unwrap();
        let back = Value::from_sql("at", FieldType::TIMESTAMP, raw).unwrap();
        assert_eq!(back, Value::Timestamp(ts));
    }

    #[test]
    fn test_double_array_survives_json() {
        let original = vec![0.1f64, -2.5e-300, 1.0 / 3.0];
        let raw = Value::from(original.clone()).to_sql().unwrap();
        let back = Value::from_sql("d", FieldType::Array(ScalarType::Double), raw).unwrap();
        assert_eq!(back, Value::from(original));
    }

    #[test]
    fn test_nan_in_array_is_rejected() {
        let err = Value::from(vec![f64::NAN]).coerce("d", FieldType::Array(ScalarType::Double));
        assert!(err.is_err());
    }

    #[test]
    fn test_non_finite_scalars_are_rejected() {
        for v in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(Value::Double(v).coerce("d", FieldType::DOUBLE).is_err());
            assert!(Value::Float(v as f32).coerce("d", FieldType::DOUBLE).is_err());
            assert!(Value::Float(v as f32).coerce("f", FieldType::FLOAT).is_err());
        }
        assert_eq!(
            Value::Double(f64::MAX).coerce("d", FieldType::DOUBLE).unwrap(),
            Value::Double(f64::MAX)
        );
    }

    #[test]
    fn test_option_from_value() {
        let none: Option<String> = FromValue::from_value("name", Value::Null).unwrap();
        assert!(none.is_none());
        assert!(String::from_value("name", Value::Null).is_err());
    }
}
