//! Per-room state and message handling.
//!
//! Each room runs as one task owning its peers and its replica of the
//! storage document. Commands arrive on an unbounded channel from the
//! connection layer; the task relays frames, applies ops under the same
//! CRDT rules as every client (the server is a replica, not a
//! coordinator), reaps silent peers, and persists snapshots on a
//! debounced schedule.

use crate::persist::{RoomBlob, SnapshotStore};
use room_storage::{SerializedCrdt, StorageDoc};
use room_wire::{Frame, PeerInfo};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Identifies one socket. Distinct from the user id: two tabs with the
/// same user both appear in presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Outbox for one peer; the connection task encodes frames to text.
pub type PeerSender = mpsc::UnboundedSender<Frame>;

/// Commands from the connection layer to a room task.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        conn_id: ConnectionId,
        sender: PeerSender,
        user_id: String,
        display_name: String,
        color: Option<String>,
        initial_storage: Option<SerializedCrdt>,
    },
    Frame {
        conn_id: ConnectionId,
        frame: Frame,
    },
    Leave {
        conn_id: ConnectionId,
    },
}

/// Room-level tunables, derived from the server config.
#[derive(Clone, Debug)]
pub struct RoomConfig {
    /// Quiet period after the last op before the snapshot is persisted.
    pub persist_debounce: Duration,
    /// Peers silent for longer than this are dropped.
    pub heartbeat_timeout: Duration,
    /// How often silent peers are checked for.
    pub reap_interval: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(75),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Presence palette; new peers without a color get the first unused one.
const PALETTE: [&str; 8] = [
    "#E91E63", "#9C27B0", "#3F51B5", "#2196F3", "#00BCD4", "#4CAF50", "#FF9800", "#795548",
];

struct RoomPeer {
    user_id: String,
    display_name: String,
    color: String,
    connected_at: u64,
    sender: PeerSender,
    last_seen: Instant,
}

/// Spawns the room task and returns its command channel.
pub fn spawn(room_id: String, store: Arc<dyn SnapshotStore>, config: RoomConfig) -> mpsc::UnboundedSender<RoomCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(room_id, store, config, rx));
    tx
}

async fn run(
    room_id: String,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
) {
    let mut room = Room::new(room_id, store, config.clone());
    let mut reap = tokio::time::interval(config.reap_interval);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let persist_at = room.persist_deadline();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => room.handle(cmd),
                None => break,
            },
            _ = reap.tick() => room.reap_silent_peers(),
            _ = tokio::time::sleep_until(persist_at.unwrap_or_else(far_future)), if persist_at.is_some() => {
                room.persist();
            }
        }
    }
    // Server is shutting the room down; flush the last state.
    room.persist_if_dirty();
    tracing::debug!(room = %room.room_id, "room task ended");
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

struct Room {
    room_id: String,
    doc: StorageDoc,
    initialized: bool,
    peers: HashMap<ConnectionId, RoomPeer>,
    store: Arc<dyn SnapshotStore>,
    config: RoomConfig,
    dirty: bool,
    last_op_at: Option<Instant>,
}

impl Room {
    fn new(room_id: String, store: Arc<dyn SnapshotStore>, config: RoomConfig) -> Self {
        Self {
            room_id,
            doc: StorageDoc::new(),
            initialized: false,
            peers: HashMap::new(),
            store,
            config,
            dirty: false,
            last_op_at: None,
        }
    }

    fn handle(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::Join {
                conn_id,
                sender,
                user_id,
                display_name,
                color,
                initial_storage,
            } => self.join(conn_id, sender, user_id, display_name, color, initial_storage),
            RoomCommand::Frame { conn_id, frame } => self.frame(conn_id, frame),
            RoomCommand::Leave { conn_id } => self.leave(conn_id),
        }
    }

    fn join(
        &mut self,
        conn_id: ConnectionId,
        sender: PeerSender,
        user_id: String,
        display_name: String,
        color: Option<String>,
        initial_storage: Option<SerializedCrdt>,
    ) {
        self.ensure_initialized(initial_storage);

        let color = color.unwrap_or_else(|| self.pick_color());
        let rejoin = self.peers.contains_key(&conn_id);
        self.peers.insert(
            conn_id,
            RoomPeer {
                user_id: user_id.clone(),
                display_name,
                color,
                connected_at: now_ms(),
                sender,
                last_seen: Instant::now(),
            },
        );
        tracing::info!(room = %self.room_id, %conn_id, user = %user_id, rejoin, "peer joined");

        self.broadcast_room_state();

        // The joiner gets the current storage after the peer list.
        let sync = Frame::StorageSync {
            snapshot: self.doc.serialize(),
            clock: self.doc.clock(),
        };
        if let Some(peer) = self.peers.get(&conn_id) {
            let _ = peer.sender.send(sync);
        }
    }

    /// Loads persisted state on the first join of a cold room; failing
    /// that, seeds from the first joiner's `initialStorage`.
    fn ensure_initialized(&mut self, initial_storage: Option<SerializedCrdt>) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        match self.store.load(&self.room_id) {
            Ok(Some(blob)) => {
                if let Err(e) = self.doc.apply_snapshot(&blob.snapshot, blob.clock) {
                    tracing::error!(room = %self.room_id, error = %e, "persisted snapshot rejected");
                } else {
                    tracing::info!(room = %self.room_id, clock = blob.clock, "room rehydrated");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(room = %self.room_id, error = %e, "persistence load failed");
            }
        }

        if let Some(seed) = initial_storage {
            match self.doc.apply_snapshot(&seed, 0) {
                Ok(()) => {
                    self.dirty = true;
                    self.last_op_at = Some(Instant::now());
                    tracing::info!(room = %self.room_id, "room seeded from initial storage");
                }
                Err(e) => {
                    tracing::warn!(room = %self.room_id, error = %e, "initial storage rejected");
                }
            }
        }
    }

    fn frame(&mut self, conn_id: ConnectionId, frame: Frame) {
        let Some(peer) = self.peers.get_mut(&conn_id) else {
            tracing::debug!(%conn_id, "frame from unknown peer dropped");
            return;
        };
        peer.last_seen = Instant::now();

        match frame {
            Frame::Op { ops } => {
                let applied = self.doc.apply_remote_ops(&ops);
                let accepted: Vec<_> = ops
                    .into_iter()
                    .zip(&applied)
                    .filter_map(|(op, ok)| ok.then_some(op))
                    .collect();
                let dropped = applied.iter().filter(|ok| !**ok).count();

                if dropped > 0 {
                    // The sender's replica now disagrees with ours; tell
                    // it so it can take a fresh snapshot.
                    tracing::debug!(room = %self.room_id, %conn_id, dropped, "ops dropped");
                    if let Some(peer) = self.peers.get(&conn_id) {
                        let _ = peer
                            .sender
                            .send(Frame::error("storage", format!("{dropped} op(s) not applied")));
                    }
                }
                if !accepted.is_empty() {
                    self.dirty = true;
                    self.last_op_at = Some(Instant::now());
                    self.relay_except(conn_id, Frame::Op { ops: accepted });
                }
            }

            frame @ (Frame::PresenceUpdate { .. }
            | Frame::CursorUpdate { .. }
            | Frame::Message { .. }) => {
                self.relay_except(conn_id, frame);
            }

            Frame::Heartbeat => {}

            other => {
                tracing::warn!(room = %self.room_id, %conn_id, frame = ?other, "unexpected frame");
            }
        }
    }

    fn leave(&mut self, conn_id: ConnectionId) {
        if let Some(peer) = self.peers.remove(&conn_id) {
            tracing::info!(room = %self.room_id, %conn_id, user = %peer.user_id, "peer left");
            self.broadcast_room_state();
            if self.peers.is_empty() {
                self.persist_if_dirty();
            }
        }
    }

    fn reap_silent_peers(&mut self) {
        let timeout = self.config.heartbeat_timeout;
        let silent: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in silent {
            tracing::info!(room = %self.room_id, %conn_id, "reaping silent peer");
            // Dropping the outbox closes the peer's socket.
            self.peers.remove(&conn_id);
            self.broadcast_room_state();
        }
        if self.peers.is_empty() {
            self.persist_if_dirty();
        }
    }

    fn broadcast_room_state(&mut self) {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .values()
            .map(|p| PeerInfo {
                user_id: p.user_id.clone(),
                display_name: p.display_name.clone(),
                color: p.color.clone(),
                connected_at: p.connected_at,
            })
            .collect();
        peers.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        self.relay_all(Frame::RoomState { peers });
    }

    fn relay_all(&mut self, frame: Frame) {
        let dead: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.sender.send(frame.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.peers.remove(&id);
        }
    }

    fn relay_except(&mut self, sender_id: ConnectionId, frame: Frame) {
        let dead: Vec<ConnectionId> = self
            .peers
            .iter()
            .filter(|(id, _)| **id != sender_id)
            .filter(|(_, p)| p.sender.send(frame.clone()).is_err())
            .map(|(id, _)| *id)
            .collect();
        for id in dead {
            self.peers.remove(&id);
        }
    }

    /// First palette color not in use; falls back to rotating when the
    /// room is larger than the palette.
    fn pick_color(&self) -> String {
        for color in PALETTE {
            if !self.peers.values().any(|p| p.color == color) {
                return color.to_string();
            }
        }
        PALETTE[self.peers.len() % PALETTE.len()].to_string()
    }

    fn persist_deadline(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        self.last_op_at
            .map(|at| at + self.config.persist_debounce)
    }

    fn persist_if_dirty(&mut self) {
        if self.dirty {
            self.persist();
        }
    }

    fn persist(&mut self) {
        let blob = RoomBlob::new(self.doc.serialize(), self.doc.clock());
        match self.store.save(&self.room_id, &blob) {
            Ok(()) => {
                self.dirty = false;
                tracing::debug!(room = %self.room_id, clock = blob.clock, "snapshot persisted");
            }
            Err(e) => {
                tracing::error!(room = %self.room_id, error = %e, "snapshot persist failed");
                // Stay dirty; the next deadline retries.
                self.last_op_at = Some(Instant::now());
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
