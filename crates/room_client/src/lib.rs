//! Client runtime for collaborative rooms.
//!
//! Two layers:
//!
//! - `connection`: a reliable WebSocket transport — one managed socket
//!   with exponential-backoff reconnection, open timeout, and heartbeat.
//! - `room`: room semantics on top — the join handshake, storage
//!   hydration and recovery, presence, cursors, custom messages, and the
//!   subscription surfaces an application renders from.
//!
//! # Example
//!
//! ```ignore
//! use room_client::{RoomClient, RoomOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let room = RoomClient::connect(
//!         "ws://localhost:8080/rooms/whiteboard-1",
//!         RoomOptions::new("whiteboard-1", "u1", "Alice"),
//!     );
//!
//!     let storage = room.storage().await?;
//!     storage.with(|doc| {
//!         let root = doc.root();
//!         doc.set(root, "counter", json!(1))
//!     })?;
//!
//!     room.update_presence(json!({"tool": "pen"}));
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod error;
pub mod room;

// Re-export commonly used types
pub use connection::{ConnectOptions, Connection, ConnectionEvent, Status};
pub use error::ClientError;
pub use room::{
    CursorEvent, Peer, PresenceEvent, RoomClient, RoomOptions, RoomStatus, StorageHandle,
};
