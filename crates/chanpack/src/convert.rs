//! Conversions between `Value` and plain Rust types.

use std::collections::BTreeMap;

use crate::Error;
use crate::Result;
use crate::marshal::Unmarshal;
use crate::uri::Uri;
use crate::value::Value;

/// Converts a Rust value into a wire `Value`.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Extracts a Rust value from a wire `Value`.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

/// A byte blob, distinct from `Vec<T>` so it maps to `Value::Bytes`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteBuf(pub Vec<u8>);

fn mismatch<T>(expected: &'static str, found: &Value) -> Result<T> {
    Err(Error::TypeMismatch { expected, found: found.kind() })
}

impl IntoValue for Value {
    fn into_value(self) -> Value { self }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> { Ok(value) }
}

impl IntoValue for () {
    fn into_value(self) -> Value { Value::Undefined }
}

impl FromValue for () {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Undefined | Value::Null => Ok(()),
            other => mismatch("undefined", &other),
        }
    }
}

impl IntoValue for bool {
    fn into_value(self) -> Value { Value::Bool(self) }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(b),
            other => mismatch("bool", &other),
        }
    }
}

impl IntoValue for i64 {
    fn into_value(self) -> Value { Value::Int(self) }
}

impl FromValue for i64 {
    fn from_value(value: Value) -> Result<Self> {
        match value.as_i64() {
            Some(v) => Ok(v),
            None => mismatch("int", &value),
        }
    }
}

impl IntoValue for u64 {
    fn into_value(self) -> Value { Value::UInt(self) }
}

impl FromValue for u64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::UInt(v) => Ok(v),
            Value::Int(v) if v >= 0 => Ok(v as u64),
            other => mismatch("uint", &other),
        }
    }
}

impl IntoValue for usize {
    fn into_value(self) -> Value { Value::UInt(self as u64) }
}

impl FromValue for usize {
    fn from_value(value: Value) -> Result<Self> {
        let v = u64::from_value(value)?;
        usize::try_from(v).map_err(|_| Error::TypeMismatch { expected: "usize", found: "uint" })
    }
}

impl IntoValue for f64 {
    fn into_value(self) -> Value { Value::Float(self) }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            Value::UInt(v) => Ok(v as f64),
            other => mismatch("float", &other),
        }
    }
}

impl IntoValue for String {
    fn into_value(self) -> Value { Value::String(self) }
}

impl IntoValue for &str {
    fn into_value(self) -> Value { Value::String(self.to_string()) }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => mismatch("string", &other),
        }
    }
}

impl IntoValue for ByteBuf {
    fn into_value(self) -> Value { Value::Bytes(self.0) }
}

impl FromValue for ByteBuf {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(ByteBuf(b)),
            other => mismatch("bytes", &other),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => mismatch("list", &other),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Undefined | Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: IntoValue> IntoValue for BTreeMap<String, T> {
    fn into_value(self) -> Value {
        Value::Map(self.into_iter().map(|(k, v)| (k, v.into_value())).collect())
    }
}

impl<T: FromValue> FromValue for BTreeMap<String, T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| T::from_value(v).map(|v| (k, v)))
                .collect(),
            other => mismatch("map", &other),
        }
    }
}

impl IntoValue for Uri {
    fn into_value(self) -> Value { Value::marshalled(self) }
}

impl FromValue for Uri {
    fn from_value(value: Value) -> Result<Self> {
        if let Some(uri) = value.downcast_ref::<Uri>() {
            return Ok(uri.clone());
        }
        // An unregistered receiver sees the payload as `Opaque`.
        match value {
            Value::Marshalled(m) if m.type_tag() == Uri::TYPE_TAG => {
                <Uri as Unmarshal>::from_value(m.to_value()).map_err(|reason| Error::Marshal {
                    tag: Uri::TYPE_TAG.to_string(),
                    reason,
                })
            }
            other => mismatch("uri", &other),
        }
    }
}
