//! # Uri
//!
//! The stock marshalled reference type: `scheme://authority/path?query#fragment`.

use std::collections::BTreeMap;
use std::fmt;

use crate::marshal::Marshal;
use crate::marshal::Unmarshal;
use crate::value::Value;

/// Uri parse failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    MissingScheme,
    InvalidScheme(String),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingScheme => write!(f, "uri has no scheme"),
            Self::InvalidScheme(s) => write!(f, "invalid uri scheme '{}'", s),
        }
    }
}

impl std::error::Error for UriError {}

/// A parsed resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Uri {
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl Uri {
    /// A `file` uri for an absolute path.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            scheme: "file".into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn parse(input: &str) -> Result<Self, UriError> {
        let (scheme, rest) = input.split_once(':').ok_or(UriError::MissingScheme)?;
        if !is_valid_scheme(scheme) {
            return Err(UriError::InvalidScheme(scheme.to_string()));
        }

        let (rest, fragment) = match rest.split_once('#') {
            Some((head, frag)) => (head, frag),
            None => (rest, ""),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((head, query)) => (head, query),
            None => (rest, ""),
        };
        let (authority, path) = match rest.strip_prefix("//") {
            Some(tail) => match tail.find('/') {
                Some(idx) => tail.split_at(idx),
                None => (tail, ""),
            },
            None => ("", rest),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            path: path.to_string(),
            query: query.to_string(),
            fragment: fragment.to_string(),
        })
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.authority.is_empty() || self.scheme == "file" {
            write!(f, "//{}", self.authority)?;
        }
        write!(f, "{}", self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

impl Marshal for Uri {
    fn type_tag(&self) -> &str {
        Self::TYPE_TAG
    }

    fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        for (key, part) in [
            ("scheme", &self.scheme),
            ("authority", &self.authority),
            ("path", &self.path),
            ("query", &self.query),
            ("fragment", &self.fragment),
        ] {
            if !part.is_empty() {
                map.insert(key.to_string(), Value::String(part.clone()));
            }
        }
        Value::Map(map)
    }
}

impl Unmarshal for Uri {
    const TYPE_TAG: &'static str = "uri";

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Map(mut map) = value else {
            return Err(format!("expected map, found {}", value.kind()));
        };
        let mut take = |key: &str| -> Result<String, String> {
            match map.remove(key) {
                None => Ok(String::new()),
                Some(Value::String(s)) => Ok(s),
                Some(other) => Err(format!("field '{}' is {}, expected string", key, other.kind())),
            }
        };
        let uri = Self {
            scheme: take("scheme")?,
            authority: take("authority")?,
            path: take("path")?,
            query: take("query")?,
            fragment: take("fragment")?,
        };
        if uri.scheme.is_empty() {
            return Err("missing scheme".into());
        }
        Ok(uri)
    }
}
