//! # Marshalling
//!
//! Custom types travel as `[type tag][payload value]`. A `MarshalRegistry`
//! maps type tags back to constructors so the receiving side rebuilds the
//! original Rust type instead of a plain structural value.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::Error;
use crate::Result;
use crate::uri::Uri;
use crate::value::Value;

/// Object-safe access to the concrete type behind a `dyn Marshal`.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A type that can be sent over the wire as a tagged payload.
pub trait Marshal: AsAny + fmt::Debug + Send + Sync + 'static {
    /// Name identifying the type on the wire.
    fn type_tag(&self) -> &str;

    /// Structural payload that `Unmarshal::from_value` turns back into `Self`.
    fn to_value(&self) -> Value;
}

/// A marshallable type that can be rebuilt from its payload.
pub trait Unmarshal: Marshal + Sized {
    const TYPE_TAG: &'static str;

    fn from_value(value: Value) -> std::result::Result<Self, String>;
}

/// A shared, immutable marshalled value.
#[derive(Clone)]
pub struct Marshalled(Arc<dyn Marshal>);

impl Marshalled {
    pub fn new<T: Marshal>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn type_tag(&self) -> &str {
        self.0.type_tag()
    }

    pub fn to_value(&self) -> Value {
        self.0.to_value()
    }

    /// Returns the inner value as `T`, if that is its concrete type.
    pub fn downcast_ref<T: Marshal>(&self) -> Option<&T> {
        // Go through the trait object; calling `as_any` on the Arc would pick the Arc itself.
        let inner: &dyn Marshal = &*self.0;
        inner.as_any().downcast_ref::<T>()
    }
}

impl fmt::Debug for Marshalled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl PartialEq for Marshalled {
    fn eq(&self, other: &Self) -> bool {
        self.type_tag() == other.type_tag() && self.to_value() == other.to_value()
    }
}

/// A marshalled value whose tag has no registered constructor.
///
/// Keeps the tag and payload so the value can be forwarded unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Opaque {
    pub tag: String,
    pub payload: Value,
}

impl Marshal for Opaque {
    fn type_tag(&self) -> &str {
        &self.tag
    }

    fn to_value(&self) -> Value {
        self.payload.clone()
    }
}

type ReviveFn = fn(Value) -> std::result::Result<Marshalled, String>;

fn revive_as<T: Unmarshal>(value: Value) -> std::result::Result<Marshalled, String> {
    T::from_value(value).map(Marshalled::new)
}

/// Maps wire type tags to constructors.
///
/// `MarshalRegistry::default()` knows the built-in `Uri` type.
#[derive(Clone)]
pub struct MarshalRegistry {
    revivers: HashMap<String, ReviveFn>,
}

impl Default for MarshalRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register::<Uri>();
        registry
    }
}

impl fmt::Debug for MarshalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.revivers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("MarshalRegistry").field("tags", &tags).finish()
    }
}

impl MarshalRegistry {
    /// A registry with no known types; every marshalled value decodes as `Opaque`.
    pub fn empty() -> Self {
        Self { revivers: HashMap::new() }
    }

    /// Registers `T` under `T::TYPE_TAG`, replacing any previous entry.
    pub fn register<T: Unmarshal>(&mut self) -> &mut Self {
        self.revivers.insert(T::TYPE_TAG.to_string(), revive_as::<T>);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.revivers.contains_key(tag)
    }

    /// Rebuilds a marshalled value from its tag and decoded payload.
    pub fn revive(&self, tag: &str, payload: Value) -> Result<Marshalled> {
        match self.revivers.get(tag) {
            Some(revive) => revive(payload).map_err(|reason| Error::Marshal {
                tag: tag.to_string(),
                reason,
            }),
            None => Ok(Marshalled::new(Opaque { tag: tag.to_string(), payload })),
        }
    }
}
