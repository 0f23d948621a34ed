//! WebSocket room server.
//!
//! The server is an authoritative message broker: it accepts upgrades on
//! a path encoding the room id, keeps one task per room, applies storage
//! ops to its own replica of each room's document, and relays frames to
//! every peer except the sender. Persistence is delegated to a
//! [`SnapshotStore`].
//!
//! # Architecture
//!
//! Each connection runs in its own task and owns the socket; each room
//! runs in its own task and owns the peer table and the document. The
//! two talk over unbounded channels, so no lock is held across I/O.
//!
//! # Example
//!
//! ```ignore
//! use room_server::{RoomServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RoomServer::new(ServerConfig::with_port(8080));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod persist;
pub mod room;

use futures_util::{SinkExt, StreamExt};
use persist::{MemorySnapshotStore, SnapshotStore};
use room::{ConnectionId, RoomCommand, RoomConfig};
use room_wire::Frame;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

pub use persist::{FileSnapshotStore, PersistError, PersistResult, RoomBlob};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Maximum concurrent connections across all rooms.
    pub max_connections: usize,
    /// Quiet period after the last op before a room snapshot persists.
    pub persist_debounce: Duration,
    /// Peers silent for longer than this are dropped.
    pub heartbeat_timeout: Duration,
    /// How often rooms check for silent peers.
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1000,
            persist_debounce: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(75),
            reap_interval: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Configuration with the given port and defaults elsewhere.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// The full bind address.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    fn room_config(&self) -> RoomConfig {
        RoomConfig {
            persist_debounce: self.persist_debounce,
            heartbeat_timeout: self.heartbeat_timeout,
            reap_interval: self.reap_interval,
        }
    }
}

type RoomRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<RoomCommand>>>>;

/// The room server.
pub struct RoomServer {
    config: ServerConfig,
    store: Arc<dyn SnapshotStore>,
    rooms: RoomRegistry,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RoomServer {
    /// Creates a server with in-memory persistence.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemorySnapshotStore::new()))
    }

    /// Creates a server with a custom snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            rooms: Arc::new(Mutex::new(HashMap::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Handle for triggering shutdown from elsewhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed {
                addr: addr.clone(),
                source: e,
            })?;
        self.serve(listener).await
    }

    /// Serves on an already-bound listener until shutdown. Open
    /// connections are closed when shutdown is signaled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "room server listening");
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        if self.connections.load(Ordering::SeqCst) >= self.config.max_connections {
                            tracing::warn!(%addr, "connection limit reached, rejecting");
                            continue;
                        }
                        self.connections.fetch_add(1, Ordering::SeqCst);
                        let connections = Arc::clone(&self.connections);
                        let rooms = Arc::clone(&self.rooms);
                        let store = Arc::clone(&self.store);
                        let room_config = self.config.room_config();
                        let shutdown = self.shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            handle_socket(stream, addr, rooms, store, room_config, shutdown).await;
                            connections.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("room server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Current server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connections: self.connections.load(Ordering::SeqCst),
            rooms: self.rooms.lock().await.len(),
        }
    }
}

/// Server statistics.
#[derive(Clone, Copy, Debug)]
pub struct ServerStats {
    /// Active WebSocket connections.
    pub connections: usize,
    /// Rooms with a running task.
    pub rooms: usize,
}

/// Signals the server (and its open connections) to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },
}

/// The room id is the last path segment of the upgrade request,
/// e.g. `/rooms/whiteboard-1`.
fn room_id_from_path(path: &str) -> Option<String> {
    let path = path.split('?').next().unwrap_or(path);
    path.split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: RoomRegistry,
    store: Arc<dyn SnapshotStore>,
    room_config: RoomConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    // Capture the request path during the handshake.
    let path_cell = Arc::new(std::sync::Mutex::new(None::<String>));
    let capture = {
        let path_cell = Arc::clone(&path_cell);
        move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let mut cell = path_cell.lock().unwrap_or_else(|e| e.into_inner());
            *cell = Some(request.uri().path().to_string());
            Ok(response)
        }
    };

    let ws = match accept_hdr_async(stream, capture).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!(%addr, error = %e, "websocket handshake failed");
            return;
        }
    };

    let path = path_cell
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .unwrap_or_default();
    let Some(path_room_id) = room_id_from_path(&path) else {
        tracing::warn!(%addr, %path, "upgrade path does not name a room");
        return;
    };
    tracing::debug!(%addr, room = %path_room_id, "connection established");

    let (mut sink, mut incoming) = ws.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
    let conn_id = ConnectionId::new();

    // Outgoing forwarder: room frames → socket text. Ends when every
    // sender is gone (peer removed from its room), then closes cleanly.
    let outgoing = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match frame.to_json() {
                Ok(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode frame"),
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut joined: Option<mpsc::UnboundedSender<RoomCommand>> = None;

    loop {
        tokio::select! {
            msg = incoming.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                    Ok(Frame::Join {
                        room_id,
                        user_id,
                        display_name,
                        color,
                        initial_storage,
                    }) => {
                        if room_id != path_room_id {
                            tracing::warn!(
                                %conn_id,
                                path_room = %path_room_id,
                                join_room = %room_id,
                                "join frame names a different room; routing by path"
                            );
                        }
                        let room_tx =
                            get_or_spawn(&rooms, &path_room_id, &store, &room_config).await;
                        let _ = room_tx.send(RoomCommand::Join {
                            conn_id,
                            sender: frame_tx.clone(),
                            user_id,
                            display_name,
                            color,
                            initial_storage,
                        });
                        joined = Some(room_tx);
                    }
                    Ok(frame) => {
                        if let Some(room_tx) = &joined {
                            let _ = room_tx.send(RoomCommand::Frame { conn_id, frame });
                        } else {
                            let _ = frame_tx.send(Frame::error("not-joined", "join a room first"));
                        }
                    }
                    // Malformed frames are logged and ignored; the
                    // sender stays connected.
                    Err(e) => {
                        tracing::warn!(%conn_id, error = %e, "malformed frame ignored");
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!(%conn_id, error = %e, "websocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    if let Some(room_tx) = joined {
        let _ = room_tx.send(RoomCommand::Leave { conn_id });
    }
    drop(frame_tx);
    let _ = outgoing.await;
    tracing::debug!(%conn_id, "connection closed");
}

async fn get_or_spawn(
    rooms: &RoomRegistry,
    room_id: &str,
    store: &Arc<dyn SnapshotStore>,
    config: &RoomConfig,
) -> mpsc::UnboundedSender<RoomCommand> {
    let mut map = rooms.lock().await;
    map.entry(room_id.to_string())
        .or_insert_with(|| room::spawn(room_id.to_string(), Arc::clone(store), config.clone()))
        .clone()
}
