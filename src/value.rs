//! Structured values stored under typed keys.
//!
//! Every registered key declares a [`ValueKind`]; the engine rejects values
//! of any other kind at set-time. The frozen form of a value is `Arc<Value>`
//! (shared, immutable); the mutable form is an owned deep copy obtained via
//! `Clone`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// The shape a key declares for its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Mapping,
    List,
    Set,
    Int,
    Text,
    Bool,
    Bytes,
}

impl ValueKind {
    /// Returns an empty value of this kind.
    pub fn empty(self) -> Value {
        match self {
            ValueKind::Mapping => Value::Mapping(BTreeMap::new()),
            ValueKind::List => Value::List(Vec::new()),
            ValueKind::Set => Value::Set(BTreeSet::new()),
            ValueKind::Int => Value::Int(0),
            ValueKind::Text => Value::Text(String::new()),
            ValueKind::Bool => Value::Bool(false),
            ValueKind::Bytes => Value::Bytes(Vec::new()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Mapping => "mapping",
            ValueKind::List => "list",
            ValueKind::Set => "set",
            ValueKind::Int => "int",
            ValueKind::Text => "text",
            ValueKind::Bool => "bool",
            ValueKind::Bytes => "bytes",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured value: one of the shapes a key can declare.
///
/// Mapping keys are `String` by construction, so the text-keys rule holds
/// structurally. Mapping values additionally must not be byte strings,
/// checked recursively at set-time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Mapping(BTreeMap<String, Value>),
    List(Vec<Value>),
    Set(BTreeSet<String>),
    Int(i64),
    Text(String),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Mapping(_) => ValueKind::Mapping,
            Value::List(_) => ValueKind::List,
            Value::Set(_) => ValueKind::Set,
            Value::Int(_) => ValueKind::Int,
            Value::Text(_) => ValueKind::Text,
            Value::Bool(_) => ValueKind::Bool,
            Value::Bytes(_) => ValueKind::Bytes,
        }
    }

    /// True if any mapping value, through nested mappings, is a byte string.
    pub fn contains_byte_values(&self) -> bool {
        match self {
            Value::Mapping(map) => map.values().any(|v| match v {
                Value::Bytes(_) => true,
                Value::Mapping(_) => v.contains_byte_values(),
                _ => false,
            }),
            _ => false,
        }
    }

    pub fn as_mapping(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_mapping_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Mapping(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&BTreeSet<String>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set_mut(&mut self) -> Option<&mut BTreeSet<String>> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }
}
