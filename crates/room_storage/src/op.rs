//! Storage operations.
//!
//! Operations are the unit of replication: every local mutation emits one,
//! every remote one is routed by path and applied under the document's
//! conflict rules. The serde shape here is the wire shape; `op` frames
//! carry these verbatim.

use crate::pos::Position;
use crate::value::SerializedCrdt;
use serde::{Deserialize, Serialize};

/// Path from the root to the target node. Each segment is a field name
/// (Object), a key (Map), or a position key (List).
pub type Path = Vec<String>;

/// A replicated storage operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Op {
    /// LWW register write on an Object or Map field.
    Set {
        path: Path,
        key: String,
        value: SerializedCrdt,
        clock: u64,
    },

    /// LWW-guarded register delete on an Object or Map field.
    Delete { path: Path, key: String, clock: u64 },

    /// List insert at a fractional position. Idempotent when the position
    /// is already occupied.
    ListInsert {
        path: Path,
        position: Position,
        value: SerializedCrdt,
        clock: u64,
    },

    /// List delete by position.
    ListDelete {
        path: Path,
        position: Position,
        clock: u64,
    },

    /// Atomic reposition of one list item.
    ListMove {
        path: Path,
        from_position: Position,
        to_position: Position,
        clock: u64,
    },
}

impl Op {
    /// The path to the node this op targets.
    pub fn path(&self) -> &Path {
        match self {
            Op::Set { path, .. }
            | Op::Delete { path, .. }
            | Op::ListInsert { path, .. }
            | Op::ListDelete { path, .. }
            | Op::ListMove { path, .. } => path,
        }
    }

    /// The logical clock carried by this op.
    pub fn clock(&self) -> u64 {
        match self {
            Op::Set { clock, .. }
            | Op::Delete { clock, .. }
            | Op::ListInsert { clock, .. }
            | Op::ListDelete { clock, .. }
            | Op::ListMove { clock, .. } => *clock,
        }
    }

    /// Re-stamps the op with a fresh clock. Used when replaying buffered
    /// or history ops so they participate in LWW at current logical time.
    pub fn with_clock(mut self, new_clock: u64) -> Op {
        match &mut self {
            Op::Set { clock, .. }
            | Op::Delete { clock, .. }
            | Op::ListInsert { clock, .. }
            | Op::ListDelete { clock, .. }
            | Op::ListMove { clock, .. } => *clock = new_clock,
        }
        self
    }
}
