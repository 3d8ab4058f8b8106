//! Payload Module
//!
//! Object payloads are structured values that may embed references to other objects.
//! In memory a reference is a counted `ObjectHandle`; on the wire it is a plain
//! `ObjectRef`. Encoding collects the embedded refs so the owner can pin them, decoding
//! turns them back into handles held by the reading worker.

pub mod scan;

use crate::error::ObjectError;
use crate::ownership::handle::ObjectHandle;
use crate::ownership::types::ObjectRef;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Ref(ObjectHandle),
}

/// The serialized form of a `Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(BTreeMap<String, WireValue>),
    Ref(ObjectRef),
}

/// Encoded payload plus the distinct refs embedded in it, in first-seen order.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub nested: Vec<ObjectRef>,
}

impl Value {
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn to_wire(&self) -> WireValue {
        match self {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Bytes(b) => WireValue::Bytes(b.clone()),
            Value::List(items) => WireValue::List(items.iter().map(Value::to_wire).collect()),
            Value::Map(entries) => WireValue::Map(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_wire()))
                    .collect(),
            ),
            Value::Ref(handle) => WireValue::Ref(handle.object_ref()),
        }
    }

    pub fn encode(&self) -> Result<Encoded, ObjectError> {
        let wire = self.to_wire();
        let nested = wire.refs();
        let bytes = bincode::serialize(&wire)?;
        Ok(Encoded { bytes, nested })
    }

    /// Every handle embedded in this value, depth first.
    pub fn handles(&self) -> Vec<&ObjectHandle> {
        let mut found = Vec::new();
        self.collect_handles(&mut found);
        found
    }

    fn collect_handles<'a>(&'a self, found: &mut Vec<&'a ObjectHandle>) {
        match self {
            Value::Ref(handle) => found.push(handle),
            Value::List(items) => items.iter().for_each(|item| item.collect_handles(found)),
            Value::Map(entries) => entries
                .values()
                .for_each(|value| value.collect_handles(found)),
            _ => {}
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
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

    pub fn as_handle(&self) -> Option<&ObjectHandle> {
        match self {
            Value::Ref(handle) => Some(handle),
            _ => None,
        }
    }
}

impl From<ObjectHandle> for Value {
    fn from(handle: ObjectHandle) -> Self {
        Value::Ref(handle)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl WireValue {
    /// Distinct embedded refs in first-seen order.
    pub fn refs(&self) -> Vec<ObjectRef> {
        let mut found = Vec::new();
        self.collect_refs(&mut found);
        found
    }

    fn collect_refs(&self, found: &mut Vec<ObjectRef>) {
        match self {
            WireValue::Ref(object) => {
                if !found.contains(object) {
                    found.push(*object);
                }
            }
            WireValue::List(items) => items.iter().for_each(|item| item.collect_refs(found)),
            WireValue::Map(entries) => entries.values().for_each(|value| value.collect_refs(found)),
            _ => {}
        }
    }

    /// Rebuilds a `Value`, replacing every ref with a clone of the matching handle.
    pub fn into_value(self, handles: &HashMap<ObjectRef, ObjectHandle>) -> Result<Value, ObjectError> {
        Ok(match self {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Bytes(b) => Value::Bytes(b),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| item.into_value(handles))
                    .collect::<Result<_, _>>()?,
            ),
            WireValue::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| Ok((key, value.into_value(handles)?)))
                    .collect::<Result<_, ObjectError>>()?,
            ),
            WireValue::Ref(object) => Value::Ref(
                handles
                    .get(&object)
                    .cloned()
                    .ok_or_else(|| ObjectError::Codec(format!("unresolved reference {}", object)))?,
            ),
        })
    }
}

pub fn decode(bytes: &[u8]) -> Result<WireValue, ObjectError> {
    Ok(bincode::deserialize(bytes)?)
}
