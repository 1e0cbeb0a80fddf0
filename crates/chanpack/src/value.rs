//! # Values
//!
//! The dynamically shaped value tree carried by calls, replies and events,
//! and its translation to and from the wire format.
//!
//! ## Invariants
//! - **Recursion Safety**: encoding and decoding are bounded by `MAX_DEPTH`.
//! - **All or nothing**: decoding either yields the complete value or an error.

use std::collections::BTreeMap;

use crate::Decoder;
use crate::Encoder;
use crate::Error;
use crate::Result;
use crate::Tag;
use crate::marshal::Marshal;
use crate::marshal::MarshalRegistry;
use crate::marshal::Marshalled;

/// The maximum nesting depth for values before failing.
pub const MAX_DEPTH: usize = 64;

/// A serializable value.
///
/// Equality is structural. Floats compare by bit pattern, so a `NaN` equals
/// itself after a round trip while `0.0` and `-0.0` stay distinct.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// No value at all (an omitted argument, a void return).
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    /// Raw bytes, never routed through text encoding.
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A value of a custom type, rebuilt through a `MarshalRegistry` on decode.
    Marshalled(Marshalled),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::UInt(a), Value::UInt(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Marshalled(a), Value::Marshalled(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Wraps a marshallable value.
    pub fn marshalled<T: Marshal>(value: T) -> Self {
        Value::Marshalled(Marshalled::new(value))
    }

    /// Short name of this value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Marshalled(_) => "marshalled",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the integer value if it fits in an `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Returns the marshalled value as `T`, if it is one.
    pub fn downcast_ref<T: Marshal>(&self) -> Option<&T> {
        match self {
            Value::Marshalled(m) => m.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self { Value::UInt(v) }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::String(v.to_string()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::String(v) }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::List(v) }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self { Value::Map(v) }
}

/// Serializes a value into a standalone buffer.
pub fn serialize(value: &Value) -> Result<Vec<u8>> {
    let mut enc = Encoder::new();
    encode_value(&mut enc, value)?;
    enc.into_bytes()
}

/// Deserializes a standalone buffer produced by `serialize`.
///
/// # Errors
/// Fails on truncated input, unknown tags, trailing bytes, or payloads that a
/// registered unmarshaller rejects.
pub fn deserialize(bytes: &[u8], registry: &MarshalRegistry) -> Result<Value> {
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, registry)?;
    dec.finish()?;
    Ok(value)
}

/// Encodes a value into the encoder stream.
///
/// # Errors
/// Returns `Error::DepthExceeded` if the value is too deeply nested.
pub fn encode_value(enc: &mut Encoder, value: &Value) -> Result<()> {
    encode_value_impl(enc, value, 0)
}

fn encode_value_impl(enc: &mut Encoder, value: &Value, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded);
    }

    match value {
        Value::Undefined => enc.undefined()?,
        Value::Null => enc.null()?,
        Value::Bool(b) => enc.bool(*b)?,
        Value::Int(v) => enc.int(*v)?,
        Value::UInt(v) => enc.uint(*v)?,
        Value::Float(v) => enc.float(*v)?,
        Value::String(s) => enc.str(s)?,
        Value::Bytes(b) => enc.bytes(b)?,
        Value::List(items) => {
            enc.list_begin()?;
            for item in items {
                encode_value_impl(enc, item, depth + 1)?;
            }
            enc.list_end()?;
        }
        Value::Map(entries) => {
            enc.map_begin()?;
            for (key, item) in entries {
                enc.entry_begin(key)?;
                encode_value_impl(enc, item, depth + 1)?;
                enc.entry_end()?;
            }
            enc.map_end()?;
        }
        Value::Marshalled(m) => {
            enc.marshalled_begin(m.type_tag())?;
            encode_value_impl(enc, &m.to_value(), depth + 1)?;
            enc.marshalled_end()?;
        }
    }
    Ok(())
}

/// Decodes the next value from the decoder, advancing past it.
pub fn decode_value(dec: &mut Decoder, registry: &MarshalRegistry) -> Result<Value> {
    decode_value_impl(dec, registry, 0)
}

fn decode_value_impl(dec: &mut Decoder, registry: &MarshalRegistry, depth: usize) -> Result<Value> {
    if depth > MAX_DEPTH {
        return Err(Error::DepthExceeded);
    }

    match dec.peek_tag()? {
        Tag::Undefined => { dec.undefined()?; Ok(Value::Undefined) }
        Tag::Null => { dec.null()?; Ok(Value::Null) }
        Tag::True | Tag::False => Ok(Value::Bool(dec.bool()?)),
        Tag::Int => Ok(Value::Int(dec.int()?)),
        Tag::UInt => Ok(Value::UInt(dec.uint()?)),
        Tag::Float => Ok(Value::Float(dec.float()?)),
        Tag::String => Ok(Value::String(dec.str()?.to_string())),
        Tag::Bytes => Ok(Value::Bytes(dec.bytes()?.to_vec())),

        Tag::List => {
            let mut iter = dec.list()?;
            let mut items = Vec::new();
            while let Some(mut item) = iter.next()? {
                items.push(decode_value_impl(&mut item, registry, depth + 1)?);
                item.finish()?;
            }
            Ok(Value::List(items))
        }

        Tag::Map => {
            let mut iter = dec.map()?;
            let mut entries = BTreeMap::new();
            while let Some((key, mut item)) = iter.next()? {
                let value = decode_value_impl(&mut item, registry, depth + 1)?;
                item.finish()?;
                entries.insert(key.to_string(), value);
            }
            Ok(Value::Map(entries))
        }

        Tag::Marshalled => {
            let (type_tag, mut body) = dec.marshalled()?;
            let payload = decode_value_impl(&mut body, registry, depth + 1)?;
            body.finish()?;
            Ok(Value::Marshalled(registry.revive(type_tag, payload)?))
        }

        // Entries only exist inside maps and frame envelopes.
        Tag::Entry => Err(Error::InvalidTag(Tag::Entry as u8)),
    }
}
