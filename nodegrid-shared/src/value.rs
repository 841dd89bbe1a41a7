//! Dynamic parameter bag (spec §9: "single variant type, field access
//! helpers take default values"). Used for `Event::Request.params`,
//! `Event::Response.result` and `Event::Response.error`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A recursive, tagged parameter value.
///
/// `BTreeMap` (not `HashMap`) is used for `Map` so that two structurally
/// equal param bags compare and serialize deterministically — important
/// for archive-file byte comparisons and persisted-queue `params` columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(u) => Some(*u),
            Value::Int(i) if *i >= 0 => Some(*i as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Field access with a default value, as the spec's design notes require
    /// ("field access helpers take default values").
    pub fn get_or<'a>(&'a self, key: &str, default: &'a Value) -> &'a Value {
        self.as_map().and_then(|m| m.get(key)).unwrap_or(default)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(Value::as_i64).unwrap_or(default)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        if let Value::Map(m) = self {
            m.insert(key.into(), value);
        }
    }

    /// Length when the value is a list or map (used by the pack-split
    /// partitioning algorithm, spec §4.6).
    pub fn item_count(&self) -> Option<usize> {
        match self {
            Value::List(l) => Some(l.len()),
            Value::Map(m) => Some(m.len()),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt(u)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::UInt(u) => write!(f, "{u}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s}"),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_null() {
        assert!(Value::default().is_null());
    }

    #[test]
    fn get_or_falls_back_to_default() {
        let mut v = Value::map();
        v.set("a", Value::from(1i64));
        let fallback = Value::from(99i64);
        assert_eq!(v.get_or("a", &fallback).as_i64(), Some(1));
        assert_eq!(v.get_or("missing", &fallback).as_i64(), Some(99));
    }

    #[test]
    fn map_is_btreemap_ordered_on_serialize() {
        let mut v = Value::map();
        v.set("z", Value::from(1i64));
        v.set("a", Value::from(2i64));
        let json = serde_json::to_string(&v).unwrap();
        // BTreeMap guarantees lexicographic key order.
        assert!(json.find("\"a\"").unwrap() < json.find("\"z\"").unwrap());
    }

    #[test]
    fn item_count_for_list_and_map() {
        let list = Value::List(vec![Value::from(1i64), Value::from(2i64)]);
        assert_eq!(list.item_count(), Some(2));
        let mut map = Value::map();
        map.set("x", Value::from(1i64));
        assert_eq!(map.item_count(), Some(1));
        assert_eq!(Value::Null.item_count(), None);
    }

    #[test]
    fn uint_and_int_interconvert_when_nonnegative() {
        let v = Value::UInt(5);
        assert_eq!(v.as_i64(), Some(5));
        let v = Value::Int(5);
        assert_eq!(v.as_u64(), Some(5));
        let v = Value::Int(-1);
        assert_eq!(v.as_u64(), None);
    }
}
