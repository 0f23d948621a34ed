//! The room client: room semantics layered on a managed connection.
//!
//! Handles the join handshake, hydrates and maintains the storage
//! document, tracks presence, relays cursors and custom messages, and
//! recovers after reconnects by re-joining, re-applying the fresh
//! snapshot in place, and replaying buffered local ops at fresh clocks.

use crate::connection::{ConnectOptions, Connection, ConnectionEvent, Status};
use crate::error::ClientError;
use room_storage::{Op, SerializedCrdt, StorageDoc};
use room_wire::{Frame, PeerInfo};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Room-level status surfaced to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoomStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    /// The transport exhausted its retry budget.
    LostConnection,
}

/// A participant as seen by this client.
#[derive(Clone, Debug, PartialEq)]
pub struct Peer {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub connected_at: u64,
    /// Accumulated presence fields, merged from `presence-update`s.
    pub presence: serde_json::Value,
}

impl Peer {
    fn from_info(info: &PeerInfo) -> Self {
        Self {
            user_id: info.user_id.clone(),
            display_name: info.display_name.clone(),
            color: info.color.clone(),
            connected_at: info.connected_at,
            presence: json!({}),
        }
    }
}

/// A presence change, self or remote.
#[derive(Clone, Debug)]
pub struct PresenceEvent {
    pub user_id: String,
    pub fields: serde_json::Value,
}

/// A relayed cursor sample.
#[derive(Clone, Debug)]
pub struct CursorEvent {
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub meta: Option<serde_json::Value>,
}

/// Options for entering a room.
#[derive(Clone, Debug)]
pub struct RoomOptions {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    /// Presence color; the server assigns one when absent.
    pub color: Option<String>,
    /// Seeds storage if this client is the room's first-ever joiner.
    pub initial_storage: Option<SerializedCrdt>,
    /// How long `storage()` waits for the first `storage-sync`.
    pub storage_timeout: Duration,
    pub connect: ConnectOptions,
}

impl RoomOptions {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            display_name: display_name.into(),
            color: None,
            initial_storage: None,
            storage_timeout: Duration::from_secs(10),
            connect: ConnectOptions::default(),
        }
    }

    pub fn with_initial_storage(mut self, storage: SerializedCrdt) -> Self {
        self.initial_storage = Some(storage);
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_connect(mut self, connect: ConnectOptions) -> Self {
        self.connect = connect;
        self
    }
}

struct Inner {
    doc: StorageDoc,
    doc_ready: bool,
    /// Ops emitted while the socket was down, re-clocked on recovery.
    pending: Vec<Op>,
    others: BTreeMap<String, Peer>,
    self_presence: serde_json::Value,
    status: RoomStatus,
    options: RoomOptions,
}

struct Channels {
    status: broadcast::Sender<RoomStatus>,
    presence: broadcast::Sender<PresenceEvent>,
    others: broadcast::Sender<Vec<Peer>>,
    cursors: broadcast::Sender<CursorEvent>,
    messages: broadcast::Sender<serde_json::Value>,
}

/// A connected (or connecting) room.
///
/// Cloneable; all clones share one connection and one storage document.
#[derive(Clone)]
pub struct RoomClient {
    inner: Arc<Mutex<Inner>>,
    conn: Connection,
    channels: Arc<Channels>,
    storage_ready: watch::Receiver<bool>,
    storage_timeout: Duration,
}

impl RoomClient {
    /// Connects to a room server and begins the join handshake. Returns
    /// immediately; await [`RoomClient::storage`] for the document.
    pub fn connect(url: impl Into<String>, options: RoomOptions) -> RoomClient {
        let (conn, event_rx) = Connection::connect(url.into(), options.connect.clone());
        let (ready_tx, ready_rx) = watch::channel(false);

        let channels = Arc::new(Channels {
            status: broadcast::channel(64).0,
            presence: broadcast::channel(256).0,
            others: broadcast::channel(64).0,
            cursors: broadcast::channel(1024).0,
            messages: broadcast::channel(256).0,
        });

        let storage_timeout = options.storage_timeout;
        let actor = actor_digit(&options.user_id);
        let inner = Arc::new(Mutex::new(Inner {
            doc: StorageDoc::new().with_actor(actor),
            doc_ready: false,
            pending: Vec::new(),
            others: BTreeMap::new(),
            self_presence: json!({}),
            status: RoomStatus::Connecting,
            options,
        }));

        let client = RoomClient {
            inner,
            conn,
            channels,
            storage_ready: ready_rx,
            storage_timeout,
        };

        tokio::spawn(drive_room(client.clone(), event_rx, ready_tx));
        client
    }

    /// Resolves once the first `storage-sync` has hydrated the document,
    /// or rejects after the configured timeout. The room stays connected
    /// on timeout; calling again retries the wait.
    pub async fn storage(&self) -> Result<StorageHandle, ClientError> {
        let mut ready = self.storage_ready.clone();
        let wait = async {
            loop {
                if *ready.borrow_and_update() {
                    return Ok(());
                }
                if ready.changed().await.is_err() {
                    return Err(ClientError::Closed);
                }
            }
        };
        match tokio::time::timeout(self.storage_timeout, wait).await {
            Ok(Ok(())) => Ok(StorageHandle {
                inner: Arc::clone(&self.inner),
                conn: self.conn.clone(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::StorageTimeout),
        }
    }

    /// Current room status.
    pub fn status(&self) -> RoomStatus {
        self.lock().status
    }

    /// The other participants, keyed presence included.
    pub fn others(&self) -> Vec<Peer> {
        self.lock().others.values().cloned().collect()
    }

    /// This client's current presence fields.
    pub fn presence(&self) -> serde_json::Value {
        self.lock().self_presence.clone()
    }

    /// Merges fields into this client's presence and broadcasts them.
    pub fn update_presence(&self, fields: serde_json::Value) {
        let user_id = {
            let mut inner = self.lock();
            merge_fields(&mut inner.self_presence, &fields);
            inner.options.user_id.clone()
        };
        let _ = self.channels.presence.send(PresenceEvent {
            user_id: user_id.clone(),
            fields: fields.clone(),
        });
        self.conn.send(Frame::PresenceUpdate { user_id, fields });
    }

    /// Broadcasts a cursor sample. Not persisted, not history-tracked;
    /// the application is expected to throttle.
    pub fn update_cursor(&self, x: f64, y: f64, meta: Option<serde_json::Value>) {
        let user_id = self.lock().options.user_id.clone();
        self.conn.send(Frame::CursorUpdate { user_id, x, y, meta });
    }

    /// Broadcasts an opaque typed payload to every other participant.
    pub fn broadcast(&self, payload: serde_json::Value) {
        self.conn.send(Frame::Message { payload });
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<RoomStatus> {
        self.channels.status.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceEvent> {
        self.channels.presence.subscribe()
    }

    pub fn subscribe_others(&self) -> broadcast::Receiver<Vec<Peer>> {
        self.channels.others.subscribe()
    }

    pub fn subscribe_cursors(&self) -> broadcast::Receiver<CursorEvent> {
        self.channels.cursors.subscribe()
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<serde_json::Value> {
        self.channels.messages.subscribe()
    }

    /// Tears down the connection. Idempotent.
    pub fn disconnect(&self) {
        self.conn.disconnect();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Access to the hydrated storage document.
///
/// Mutations apply locally first; emitted ops are sent while connected
/// and buffered for re-clocked replay otherwise.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<Mutex<Inner>>,
    conn: Connection,
}

impl StorageHandle {
    /// Runs a closure against the document, then flushes emitted ops.
    pub fn with<R>(&self, f: impl FnOnce(&mut StorageDoc) -> R) -> R {
        let mut inner = self.lock();
        let result = f(&mut inner.doc);
        flush_ops(&mut inner, &self.conn);
        result
    }

    /// Groups mutations: subscribers fire once, the remote peer receives
    /// every op of the batch in one frame, and the batch undoes as one
    /// step.
    pub fn batch<R>(&self, f: impl FnOnce(&mut StorageDoc) -> R) -> R {
        self.with(|doc| doc.batch(f))
    }

    pub fn undo(&self) -> bool {
        self.with(|doc| doc.undo())
    }

    pub fn redo(&self) -> bool {
        self.with(|doc| doc.redo())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends freshly emitted ops, or buffers them while the room is down.
///
/// The room status (not the raw transport status) gates the send: it
/// only flips to `Connected` after the join frame is queued, so an op
/// can never overtake the handshake.
fn flush_ops(inner: &mut Inner, conn: &Connection) {
    let ops = inner.doc.take_outbound();
    if ops.is_empty() {
        return;
    }
    if inner.status == RoomStatus::Connected {
        if !conn.send(Frame::Op { ops: ops.clone() }) {
            inner.pending.extend(ops);
        }
    } else {
        inner.pending.extend(ops);
    }
}

async fn drive_room(
    client: RoomClient,
    mut event_rx: tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
    ready_tx: watch::Sender<bool>,
) {
    while let Some(event) = event_rx.recv().await {
        match event {
            ConnectionEvent::Status(Status::Connected) => {
                // Join first, then flip the status: ops flushed after the
                // flip queue behind the join frame on the socket.
                send_join(&client);
                set_status(&client, RoomStatus::Connected);
            }
            ConnectionEvent::Status(Status::Connecting) => {
                // Only surfaced for the very first attempt; retries show
                // as `Reconnecting` until the socket opens.
                if client.status() == RoomStatus::Connecting {
                    set_status(&client, RoomStatus::Connecting);
                }
            }
            ConnectionEvent::Status(Status::Reconnecting) => {
                set_status(&client, RoomStatus::Reconnecting);
            }
            ConnectionEvent::Status(Status::Disconnected) => {
                set_status(&client, RoomStatus::Disconnected);
            }
            ConnectionEvent::LostConnection => {
                set_status(&client, RoomStatus::LostConnection);
            }
            ConnectionEvent::Frame(frame) => handle_frame(&client, frame, &ready_tx),
        }
    }
}

fn set_status(client: &RoomClient, status: RoomStatus) {
    client.lock().status = status;
    let _ = client.channels.status.send(status);
}

fn send_join(client: &RoomClient) {
    let (room_id, user_id, display_name, color, initial_storage) = {
        let inner = client.lock();
        (
            inner.options.room_id.clone(),
            inner.options.user_id.clone(),
            inner.options.display_name.clone(),
            inner.options.color.clone(),
            inner.options.initial_storage.clone(),
        )
    };
    client.conn.send(Frame::Join {
        room_id,
        user_id,
        display_name,
        color,
        initial_storage,
    });
}

fn handle_frame(client: &RoomClient, frame: Frame, ready_tx: &watch::Sender<bool>) {
    match frame {
        Frame::RoomState { peers } => {
            let others: Vec<Peer> = {
                let mut inner = client.lock();
                let self_id = inner.options.user_id.clone();
                // Adopt the server-assigned color so re-joins keep it.
                if let Some(me) = peers.iter().find(|p| p.user_id == self_id) {
                    inner.options.color = Some(me.color.clone());
                }
                // Presence is rebuilt from scratch on every room-state;
                // there is no merge across joins.
                inner.others = peers
                    .iter()
                    .filter(|p| p.user_id != self_id)
                    .map(|p| (p.user_id.clone(), Peer::from_info(p)))
                    .collect();
                inner.others.values().cloned().collect()
            };
            let _ = client.channels.others.send(others);
        }

        Frame::StorageSync { snapshot, clock } => {
            let mut inner = client.lock();
            if let Err(e) = inner.doc.apply_snapshot(&snapshot, clock) {
                tracing::error!(error = %e, "snapshot apply failed");
                return;
            }
            inner.doc_ready = true;
            let buffered = std::mem::take(&mut inner.pending);
            if !buffered.is_empty() {
                inner.doc.replay_local(&buffered);
            }
            flush_ops(&mut inner, &client.conn);
            drop(inner);
            let _ = ready_tx.send(true);
        }

        Frame::Op { ops } => {
            let mut inner = client.lock();
            if inner.doc_ready {
                inner.doc.apply_remote_ops(&ops);
            } else {
                // Ops racing ahead of the snapshot are superseded by it.
                tracing::debug!(count = ops.len(), "ops before storage sync dropped");
            }
        }

        Frame::PresenceUpdate { user_id, fields } => {
            let others: Vec<Peer> = {
                let mut inner = client.lock();
                let peer = inner
                    .others
                    .entry(user_id.clone())
                    .or_insert_with(|| Peer {
                        user_id: user_id.clone(),
                        display_name: String::new(),
                        color: String::new(),
                        connected_at: 0,
                        presence: json!({}),
                    });
                merge_fields(&mut peer.presence, &fields);
                inner.others.values().cloned().collect()
            };
            let _ = client.channels.presence.send(PresenceEvent { user_id, fields });
            let _ = client.channels.others.send(others);
        }

        Frame::CursorUpdate { user_id, x, y, meta } => {
            let _ = client.channels.cursors.send(CursorEvent { user_id, x, y, meta });
        }

        Frame::Message { payload } => {
            let _ = client.channels.messages.send(payload);
        }

        Frame::Error { code, message } => {
            tracing::warn!(code = %code, message = %message, "server error frame");
            if code == "storage" {
                // The server replica diverged from us; take a fresh
                // snapshot by re-joining.
                send_join(client);
            }
        }

        Frame::Join { .. } | Frame::Heartbeat => {
            tracing::warn!("unexpected client-bound frame");
        }
    }
}

/// Merges a partial presence object into the stored record. Non-object
/// payloads replace the record wholesale.
fn merge_fields(target: &mut serde_json::Value, fields: &serde_json::Value) {
    match (target.as_object_mut(), fields.as_object()) {
        (Some(target), Some(fields)) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *target = fields.clone(),
    }
}

/// Replica discriminator for list position generation, derived from the
/// user id so concurrent clients interleave deterministically.
fn actor_digit(user_id: &str) -> u8 {
    let hash = user_id
        .bytes()
        .fold(0xcbf2u16, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u16));
    (hash % 61) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_digit_is_stable_and_bounded() {
        assert_eq!(actor_digit("alice"), actor_digit("alice"));
        assert!(actor_digit("alice") < 61);
        assert!(actor_digit("") < 61);
    }

    #[test]
    fn test_merge_fields_partial_update() {
        let mut presence = json!({"name": "A", "x": 1});
        merge_fields(&mut presence, &json!({"x": 2, "tool": "pen"}));
        assert_eq!(presence, json!({"name": "A", "x": 2, "tool": "pen"}));
    }

    #[test]
    fn test_merge_fields_non_object_replaces() {
        let mut presence = json!({"a": 1});
        merge_fields(&mut presence, &json!(null));
        assert_eq!(presence, json!(null));
    }

    #[test]
    fn test_room_options_builder() {
        let options = RoomOptions::new("r1", "u1", "Alice")
            .with_color("#123456")
            .with_initial_storage(SerializedCrdt::object());
        assert_eq!(options.room_id, "r1");
        assert_eq!(options.color.as_deref(), Some("#123456"));
        assert!(options.initial_storage.is_some());
        assert_eq!(options.storage_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_peer_from_info_starts_with_empty_presence() {
        let info = PeerInfo {
            user_id: "u2".into(),
            display_name: "Bob".into(),
            color: "#fff".into(),
            connected_at: 42,
        };
        let peer = Peer::from_info(&info);
        assert_eq!(peer.user_id, "u2");
        assert_eq!(peer.presence, json!({}));
    }
}
