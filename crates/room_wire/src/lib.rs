//! Wire protocol for the room sync runtime.
//!
//! Every frame is JSON text over a WebSocket with a `type` discriminator.
//! Both directions share one `Frame` enum: clients send `join`, `op`,
//! `presence-update`, `cursor-update`, `message` and `heartbeat`; servers
//! send `room-state`, `storage-sync`, `error`, and relay the rest.
//! Storage ops and snapshot envelopes come from `room_storage`, so client
//! and server speak one schema by construction.

use room_storage::{Op, SerializedCrdt};
use serde::{Deserialize, Serialize};

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame was not valid JSON or did not match any frame schema.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One peer as reported in `room-state`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub user_id: String,
    pub display_name: String,
    /// Presence color, assigned by the server when the client did not
    /// supply one.
    pub color: String,
    /// Milliseconds since the UNIX epoch at which the peer joined.
    pub connected_at: u64,
}

/// A protocol frame. The serde tag is the `type` field on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Client → server: join a room. The server answers with
    /// `room-state` and then `storage-sync`.
    Join {
        room_id: String,
        user_id: String,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        /// Seeds the room's storage if the room has none; otherwise
        /// ignored.
        #[serde(skip_serializing_if = "Option::is_none")]
        initial_storage: Option<SerializedCrdt>,
    },

    /// Server → client: the authoritative peer list.
    RoomState { peers: Vec<PeerInfo> },

    /// Server → client: initial or replacement storage state.
    StorageSync { snapshot: SerializedCrdt, clock: u64 },

    /// Either direction: storage operations. The server applies them to
    /// its replica and relays to every peer except the sender.
    Op { ops: Vec<Op> },

    /// Either direction: presence fields. Relayed, never persisted.
    PresenceUpdate {
        user_id: String,
        fields: serde_json::Value,
    },

    /// Either direction: high-frequency cursor channel. Relayed, never
    /// persisted, never history-tracked.
    CursorUpdate {
        user_id: String,
        x: f64,
        y: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<serde_json::Value>,
    },

    /// Either direction: opaque typed broadcast.
    Message { payload: serde_json::Value },

    /// Client → server keepalive. No response.
    Heartbeat,

    /// Server → client soft-error notification. The connection stays up.
    Error { code: String, message: String },
}

impl Frame {
    /// Serializes to the wire text.
    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses wire text.
    pub fn from_json(text: &str) -> Result<Frame, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Builds an `error` frame.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Frame {
        Frame::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
