//! Error types for the storage crate.

use crate::doc::{NodeId, NodeKind};
use crate::pos::PositionError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage document API.
///
/// Remote operations never produce these: conflict rejections and
/// unroutable paths are ordinary no-ops under the replication rules.
/// These errors mark local misuse of the tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    /// The node id does not refer to an attached node.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// The operation does not apply to this node kind, e.g. a register
    /// write on a List.
    #[error("wrong node kind: expected {expected:?}, found {found:?}")]
    WrongKind { expected: NodeKind, found: NodeKind },

    /// A list index beyond the current length.
    #[error("list index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    /// A fractional position could not be generated.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// The snapshot root was not a LiveObject envelope.
    #[error("snapshot root must be a LiveObject")]
    InvalidSnapshot,
}
