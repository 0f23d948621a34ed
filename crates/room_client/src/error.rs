//! Error types for the room client.

use thiserror::Error;

/// Errors surfaced by the public client API.
///
/// Transport and storage conflicts recover internally; the only
/// failures an application sees are the storage-sync wait and sending
/// through a client that was shut down.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The first `storage-sync` did not arrive within the timeout. The
    /// room stays connected; the caller may retry.
    #[error("timed out waiting for storage sync")]
    StorageTimeout,

    /// The client was disconnected and its driver has shut down.
    #[error("client is shut down")]
    Closed,

    /// A local storage mutation was rejected.
    #[error(transparent)]
    Storage(#[from] room_storage::StorageError),
}
