//! Conflict-free replicated storage for collaborative rooms.
//!
//! This crate implements the persistent half of a room: a tree of three
//! live data types (Object, Map, List) replicated across any number of
//! participants. Operations commute under a Lamport clock with
//! last-writer-wins resolution on registers and fractional-index ordering
//! on lists, so replicas that see the same ops converge to the same tree
//! regardless of delivery order.
//!
//! # Modules
//!
//! - `clock`: the Lamport logical clock
//! - `pos`: fractional index positions for list ordering
//! - `value`: the serialized CRDT envelope (wire and snapshot format)
//! - `op`: replicated storage operations
//! - `doc`: the storage document — tree, subscriptions, snapshots
//! - `history`: undo/redo stacks of inverse operations
//! - `error`: error types for the storage crate
//!
//! # Example
//!
//! ```
//! use room_storage::{SerializedCrdt, StorageDoc};
//! use serde_json::json;
//!
//! let mut doc = StorageDoc::new();
//! let root = doc.root();
//! doc.set(root, "counter", json!(0)).unwrap();
//! doc.set(root, "shapes", SerializedCrdt::list()).unwrap();
//!
//! let shapes = doc.child(root, "shapes").unwrap();
//! doc.list_push(shapes, json!({"kind": "rect"})).unwrap();
//!
//! // Every local mutation emitted an op for the network.
//! assert_eq!(doc.take_outbound().len(), 3);
//! ```

pub mod clock;
pub mod doc;
pub mod error;
pub mod history;
pub mod op;
pub mod pos;
pub mod value;

// Re-export commonly used types
pub use clock::LamportClock;
pub use doc::{ChangeEvent, NodeId, NodeKind, StorageDoc, SubscriptionId, Value};
pub use error::{StorageError, StorageResult};
pub use history::{History, DEFAULT_CAP, DEFAULT_COALESCE_WINDOW};
pub use op::{Op, Path};
pub use pos::{Position, PositionError};
pub use value::{SerializedCrdt, SerializedItem, SerializedNode};
