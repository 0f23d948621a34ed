//! WebSocket connection manager.
//!
//! Maintains at most one open socket to a URL and recovers it
//! automatically: exponential backoff with jitter between attempts, an
//! open timeout so a hung handshake cannot stall recovery, and a
//! heartbeat frame while connected so silent intermediaries do not
//! idle-close the socket.
//!
//! The manager runs as one spawned task. Callers hold a cheap [`Connection`]
//! handle: frames go in through an unbounded command channel, decoded
//! frames and status transitions come back on an event channel.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use room_wire::Frame;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Transport status, in the order the state machine walks it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No socket, and no attempt scheduled. Terminal unless `connect` is
    /// called again; reached by user disconnect or retry exhaustion.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    Connected,
    /// The socket dropped; a retry is scheduled.
    Reconnecting,
}

/// Events delivered to the owner of the connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Status(Status),
    Frame(Frame),
    /// The retry budget is exhausted; the manager gave up.
    LostConnection,
}

/// Tunables for the reconnect loop.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    pub open_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_retries: 20,
            open_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum Command {
    Send(Frame),
    Disconnect,
}

/// Handle to a managed connection. Cloneable; all clones drive the same
/// socket.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<Status>,
}

impl Connection {
    /// Starts the manager task and begins connecting.
    pub fn connect(
        url: String,
        options: ConnectOptions,
    ) -> (Connection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::Disconnected);

        tokio::spawn(drive(url, options, cmd_rx, event_tx, status_tx));

        (Connection { cmd_tx, status_rx }, event_rx)
    }

    /// Current transport status.
    pub fn status(&self) -> Status {
        *self.status_rx.borrow()
    }

    /// Queues a frame for the open socket. Best-effort: while the socket
    /// is down the frame is dropped, and the caller's recovery protocol
    /// (re-join, buffered ops) re-establishes state on reconnect.
    pub fn send(&self, frame: Frame) -> bool {
        self.cmd_tx.send(Command::Send(frame)).is_ok()
    }

    /// Tears the connection down. Idempotent: cancels any scheduled
    /// retry, closes the socket cleanly, and ends the manager task.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

fn publish(status_tx: &watch::Sender<Status>, event_tx: &mpsc::UnboundedSender<ConnectionEvent>, status: Status) {
    let _ = status_tx.send(status);
    let _ = event_tx.send(ConnectionEvent::Status(status));
}

async fn drive(
    url: String,
    options: ConnectOptions,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    status_tx: watch::Sender<Status>,
) {
    let mut attempt: u32 = 0;
    loop {
        publish(&status_tx, &event_tx, Status::Connecting);

        let connected = tokio::select! {
            result = timeout(options.open_timeout, connect_async(url.as_str())) => match result {
                Ok(Ok((ws, _response))) => Some(ws),
                Ok(Err(e)) => {
                    tracing::warn!(url = %url, error = %e, "connect failed");
                    None
                }
                Err(_) => {
                    tracing::warn!(url = %url, "connect attempt timed out");
                    None
                }
            },
            _ = wait_for_disconnect(&mut cmd_rx) => break,
        };

        if let Some(ws) = connected {
            attempt = 0;
            publish(&status_tx, &event_tx, Status::Connected);
            match run_session(ws, &mut cmd_rx, &event_tx, options.heartbeat_interval).await {
                SessionEnd::Disconnected => break,
                SessionEnd::Dropped => {}
            }
        }

        attempt += 1;
        if attempt > options.max_retries {
            tracing::warn!(url = %url, retries = options.max_retries, "retry budget exhausted");
            let _ = event_tx.send(ConnectionEvent::LostConnection);
            break;
        }

        publish(&status_tx, &event_tx, Status::Reconnecting);
        let delay = backoff_delay(&options, attempt);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_disconnect(&mut cmd_rx) => break,
        }
    }
    publish(&status_tx, &event_tx, Status::Disconnected);
}

/// Waits for a `Disconnect` command, discarding queued sends: frames
/// addressed to a dead socket are not worth replaying verbatim later.
/// Resolves as well when every handle is gone.
async fn wait_for_disconnect(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Send(frame)) => {
                tracing::debug!(frame = ?frame, "dropping frame while offline");
            }
            Some(Command::Disconnect) | None => return,
        }
    }
}

enum SessionEnd {
    /// The socket dropped; schedule a reconnect.
    Dropped,
    /// The user asked for the teardown.
    Disconnected,
}

async fn run_session(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    event_tx: &mpsc::UnboundedSender<ConnectionEvent>,
    heartbeat_interval: Duration,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(frame)) => match frame.to_json() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode frame"),
                },
                Some(Command::Disconnect) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Disconnected;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match Frame::from_json(&text) {
                    Ok(frame) => {
                        let _ = event_tx.send(ConnectionEvent::Frame(frame));
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed frame dropped"),
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "websocket error");
                    return SessionEnd::Dropped;
                }
                Some(Ok(_)) => {}
            },

            _ = heartbeat.tick() => {
                match Frame::Heartbeat.to_json() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to encode heartbeat"),
                }
            }
        }
    }
}

/// Exponential backoff with 20% jitter, capped.
fn backoff_delay(options: &ConnectOptions, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let base = options
        .base_delay
        .saturating_mul(1u32 << exp)
        .min(options.max_delay);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(jitter).min(options.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let options = ConnectOptions::default();
        let first = backoff_delay(&options, 1);
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(300));

        let tenth = backoff_delay(&options, 10);
        assert!(tenth > first);

        let huge = backoff_delay(&options, 30);
        assert!(huge <= options.max_delay);
    }

    #[test]
    fn test_default_options_match_protocol() {
        let options = ConnectOptions::default();
        assert_eq!(options.base_delay, Duration::from_millis(250));
        assert_eq!(options.max_delay, Duration::from_secs(30));
        assert_eq!(options.max_retries, 20);
        assert_eq!(options.open_timeout, Duration::from_secs(10));
        assert_eq!(options.heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_to_dead_port_reports_reconnecting_then_lost() {
        let options = ConnectOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: 2,
            open_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(30),
        };
        // Port 1 is essentially never listening.
        let (_conn, mut events) = Connection::connect("ws://127.0.0.1:1/".to_string(), options);

        let mut saw_reconnecting = false;
        let mut saw_lost = false;
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Status(Status::Reconnecting) => saw_reconnecting = true,
                ConnectionEvent::LostConnection => saw_lost = true,
                ConnectionEvent::Status(Status::Disconnected) if saw_lost => break,
                _ => {}
            }
        }
        assert!(saw_reconnecting);
        assert!(saw_lost);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_terminal() {
        let (conn, mut events) = Connection::connect(
            "ws://127.0.0.1:1/".to_string(),
            ConnectOptions {
                base_delay: Duration::from_millis(50),
                ..ConnectOptions::default()
            },
        );
        conn.disconnect();
        conn.disconnect();

        // The driver ends with a final Disconnected status.
        let mut last = None;
        while let Some(event) = events.recv().await {
            if let ConnectionEvent::Status(s) = event {
                last = Some(s);
            }
        }
        assert_eq!(last, Some(Status::Disconnected));
    }
}
