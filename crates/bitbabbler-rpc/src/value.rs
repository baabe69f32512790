use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A small tagged JSON value tree.
///
/// `Object` is backed by a `BTreeMap` so that serialization is always
/// sorted by key, independent of insertion order, which keeps the
/// `ReportStats`/`GetRawData` payloads byte-for-byte reproducible for
/// tests regardless of which source reported first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        if let Value::Object(m) = self {
            m.insert(key.into(), value.into());
        }
        self
    }

    /// Build an object from a list of key/value pairs in one expression,
    /// for report-building call sites that would otherwise need a `let
    /// mut` just to call [`Value::insert`] repeatedly.
    pub fn object_from<K: Into<String>, V: Into<Value>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        let mut obj = Value::object();
        for (k, v) in entries {
            obj.insert(k, v);
        }
        obj
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unserializable>"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_serializes_sorted_by_key() {
        let mut v = Value::object();
        v.insert("zeta", 1.0);
        v.insert("alpha", 2.0);
        let s = serde_json::to_string(&v).unwrap();
        assert_eq!(s, r#"{"alpha":2.0,"zeta":1.0}"#);
    }

    #[test]
    fn round_trips_through_serde_json() {
        let mut v = Value::object();
        v.insert("a", Value::Array(vec![Value::Number(1.0), Value::Null]));
        let s = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v, back);
    }
}
