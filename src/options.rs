//! Per-request options carried in request extensions.
//!
//! ```
//! use retry_gate::{RequestOptions, REQUEST_OPTION};
//!
//! let mut request = http::Request::new(());
//! request.extensions_mut().insert(RequestOptions::cache_key("telegram:send_message"));
//!
//! let options = request.extensions().get::<RequestOptions>().unwrap();
//! assert_eq!(options.get(REQUEST_OPTION).and_then(|v| v.as_str()), Some("telegram:send_message"));
//! ```

use serde_json::{Map, Value};
use std::fmt;

/// Name of the option that selects the retry-after bucket for a request.
pub const REQUEST_OPTION: &str = "retry_after_cache_key";

/// Loosely typed request options, inserted into `http::Request` extensions.
///
/// Values are JSON so that callers assembling options from configuration can pass
/// anything; the gate validates the cache key's type when the request is issued.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions(Map<String, Value>);

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options carrying only a retry-after cache key.
    pub fn cache_key(key: impl Into<String>) -> Self {
        Self::new().with(REQUEST_OPTION, key.into())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }
}

impl From<Map<String, Value>> for RequestOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// What was supplied where a cache key was expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// No option and no default key.
    Missing,
    EmptyString,
    Integer,
    Float,
    Boolean,
    Null,
    Array,
    Object,
}

impl KeyKind {
    /// Classify a non-conforming option value. Non-empty strings are not a `KeyKind`.
    pub fn of(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if s.is_empty() => Some(KeyKind::EmptyString),
            Value::String(_) => None,
            Value::Null => Some(KeyKind::Null),
            Value::Bool(_) => Some(KeyKind::Boolean),
            Value::Number(n) if n.is_f64() => Some(KeyKind::Float),
            Value::Number(_) => Some(KeyKind::Integer),
            Value::Array(_) => Some(KeyKind::Array),
            Value::Object(_) => Some(KeyKind::Object),
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::Missing => "none",
            KeyKind::EmptyString => "empty string",
            KeyKind::Integer => "integer",
            KeyKind::Float => "float",
            KeyKind::Boolean => "boolean",
            KeyKind::Null => "null",
            KeyKind::Array => "array",
            KeyKind::Object => "object",
        };
        f.write_str(name)
    }
}
