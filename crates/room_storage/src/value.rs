//! Serialized CRDT values.
//!
//! The wire and persistence format for storage trees: a node is a tagged
//! envelope (`{"type": "LiveObject", "data": ...}`, `{"type": "LiveMap",
//! "data": ...}`, `{"type": "LiveList", "items": ...}`) and anything else
//! is a plain JSON scalar. The same envelopes appear inside `set` and
//! `list-insert` operations, so a nested subtree travels as one value.

use crate::pos::Position;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A serialized storage value: either a CRDT node envelope or a JSON
/// scalar. Deserialization tries the envelope first, so a plain object
/// that happens to carry a `type` field matching one of the envelope tags
/// is read as a node; applications should avoid that key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SerializedCrdt {
    Node(SerializedNode),
    Scalar(serde_json::Value),
}

/// The tagged node envelopes. Object and Map data are kept in a
/// `BTreeMap` so that serialization is deterministic: converged replicas
/// produce byte-identical snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SerializedNode {
    LiveObject { data: BTreeMap<String, SerializedCrdt> },
    LiveMap { data: BTreeMap<String, SerializedCrdt> },
    LiveList { items: Vec<SerializedItem> },
}

/// One list entry: its fractional position and its value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedItem {
    pub position: Position,
    pub value: SerializedCrdt,
}

impl SerializedCrdt {
    /// An empty `LiveObject` envelope.
    pub fn object() -> Self {
        SerializedCrdt::Node(SerializedNode::LiveObject {
            data: BTreeMap::new(),
        })
    }

    /// An empty `LiveMap` envelope.
    pub fn map() -> Self {
        SerializedCrdt::Node(SerializedNode::LiveMap {
            data: BTreeMap::new(),
        })
    }

    /// An empty `LiveList` envelope.
    pub fn list() -> Self {
        SerializedCrdt::Node(SerializedNode::LiveList { items: Vec::new() })
    }

    /// A `LiveObject` envelope with scalar fields taken from a JSON
    /// object. Convenient for seeding initial storage.
    pub fn object_from_json(fields: serde_json::Value) -> Self {
        let data = match fields {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, SerializedCrdt::Scalar(v)))
                .collect(),
            _ => BTreeMap::new(),
        };
        SerializedCrdt::Node(SerializedNode::LiveObject { data })
    }

    /// Whether this value is a node envelope.
    pub fn is_node(&self) -> bool {
        matches!(self, SerializedCrdt::Node(_))
    }

    /// The scalar payload, if this value is one.
    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            SerializedCrdt::Scalar(v) => Some(v),
            SerializedCrdt::Node(_) => None,
        }
    }
}

impl From<serde_json::Value> for SerializedCrdt {
    fn from(value: serde_json::Value) -> Self {
        SerializedCrdt::Scalar(value)
    }
}
