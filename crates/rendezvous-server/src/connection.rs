//! Per-connection runtime.
//!
//! Each upgraded WebSocket gets one task that reads frames and feeds them to
//! the shared [`SignalingDriver`], plus a writer task draining an unbounded
//! outbound queue. Actions are enqueued while the driver lock is still held,
//! so every queue sees notifications in the order the state changed. The
//! network writes happen on the writer tasks, never under the lock.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
    routing::get,
};
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::task::TaskTracker;

use crate::{
    driver::{CloseCode, LogLevel, ServerAction, ServerEvent, SignalingDriver},
    registry::ConnectionId,
    transport::{RemoteAddr, health_check},
};

/// Reason attached to the close sent on shutdown.
const SHUTDOWN_REASON: &str = "server shutting down";

/// How long shutdown waits for close frames to be written.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Frame queued for a connection's writer task.
#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Bytes),
    Ping,
    Close { code: CloseCode, reason: String },
}

/// Shared state for all connections.
pub(crate) struct SharedState {
    /// Protocol state machine, one lock for every compound transition
    driver: Mutex<SignalingDriver>,
    /// Connection ID → outbound queue
    outbound: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>,
    /// Next connection ID to hand out
    next_connection_id: AtomicU64,
    /// Receive silence before a ping
    keepalive_interval: Duration,
    /// Writer tasks, awaited on shutdown
    writers: TaskTracker,
}

impl SharedState {
    pub(crate) fn new(keepalive_interval: Duration) -> Self {
        Self {
            driver: Mutex::new(SignalingDriver::new()),
            outbound: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            keepalive_interval,
            writers: TaskTracker::new(),
        }
    }

    fn allocate_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Best-effort close of every open connection.
    ///
    /// Queues a normal close on each connection, then waits up to
    /// [`SHUTDOWN_GRACE`] for the writers to put them on the wire. In-flight
    /// sends queued before the close still go out; nothing else is drained.
    pub(crate) async fn close_all(&self) {
        {
            let outbound = self.outbound.read().await;
            tracing::info!("Closing {} connections", outbound.len());
            for tx in outbound.values() {
                // Receiver gone means the connection is already closing
                let _ = tx.send(Outbound::Close {
                    code: CloseCode::Normal,
                    reason: SHUTDOWN_REASON.to_string(),
                });
            }
        }

        self.writers.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.writers.wait()).await.is_err() {
            tracing::warn!("{} writers still running after shutdown grace", self.writers.len());
        }
    }
}

/// Routes: the health path, and a WebSocket upgrade for everything else.
pub(crate) fn router(shared: Arc<SharedState>, health_path: &str) -> Router {
    Router::new().route(health_path, get(health_check)).fallback(upgrade).with_state(shared)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<SharedState>>,
    ConnectInfo(RemoteAddr(remote_addr)): ConnectInfo<RemoteAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, remote_addr, shared))
}

/// Whether the connection a dispatch originated from should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Open,
    Closed,
}

/// Handle a single WebSocket connection.
async fn handle_connection(ws: WebSocket, remote_addr: SocketAddr, shared: Arc<SharedState>) {
    let connection = shared.allocate_connection_id();
    tracing::debug!(%connection, %remote_addr, "New connection");

    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    shared.outbound.write().await.insert(connection, tx.clone());
    let writer = shared.writers.spawn(write_loop(connection, sink, rx));

    let reason =
        match dispatch(&shared, ServerEvent::ConnectionAccepted { connection, remote_addr }).await {
            Disposition::Closed => "closed by server".to_string(),
            Disposition::Open => read_loop(connection, &mut stream, &tx, &shared).await,
        };

    dispatch(&shared, ServerEvent::ConnectionClosed { connection, reason }).await;

    shared.outbound.write().await.remove(&connection);
    drop(tx);

    if let Err(e) = writer.await {
        tracing::warn!(%connection, "Writer task failed: {}", e);
    }
}

/// Read frames until the connection ends. Returns the close reason.
async fn read_loop(
    connection: ConnectionId,
    stream: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    shared: &SharedState,
) -> String {
    loop {
        let message = match receive(connection, stream, tx, shared.keepalive_interval).await {
            Some(Ok(message)) => message,
            Some(Err(e)) => return format!("read error: {e}"),
            None => return "stream ended".to_string(),
        };

        let event = match message {
            Message::Text(text) => {
                ServerEvent::FrameReceived { connection, text: text.as_str().to_owned() }
            },
            Message::Binary(data) => ServerEvent::BinaryReceived { connection, data },
            Message::Close(frame) => {
                return match frame {
                    Some(frame) => {
                        format!("closed by peer ({}): {}", frame.code, frame.reason.as_str())
                    },
                    None => "closed by peer".to_string(),
                };
            },
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if dispatch(shared, event).await == Disposition::Closed {
            return "closed by server".to_string();
        }
    }
}

/// Wait for the next message, pinging the peer every `keepalive` of silence.
///
/// The ping never ends the wait; only the stream ending or the writer being
/// gone does.
async fn receive(
    connection: ConnectionId,
    stream: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    keepalive: Duration,
) -> Option<Result<Message, axum::Error>> {
    loop {
        match tokio::time::timeout(keepalive, stream.next()).await {
            Ok(next) => return next,
            Err(_) => {
                tracing::debug!(%connection, "Keepalive ping");
                if tx.send(Outbound::Ping).is_err() {
                    return None;
                }
            },
        }
    }
}

/// Drain the outbound queue into the socket.
async fn write_loop(
    connection: ConnectionId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        let (message, last) = match outbound {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Binary(data) => (Message::Binary(data), false),
            Outbound::Ping => (Message::Ping(Bytes::new()), false),
            Outbound::Close { code, reason } => {
                let frame = CloseFrame { code: ws_close_code(code), reason: reason.into() };
                (Message::Close(Some(frame)), true)
            },
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!(%connection, "Write failed: {}", e);
            break;
        }
        if last {
            break;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::trace!(%connection, "Sink close failed: {}", e);
    }
}

fn ws_close_code(code: CloseCode) -> u16 {
    match code {
        CloseCode::Normal => close_code::NORMAL,
        CloseCode::ProtocolError => close_code::PROTOCOL,
    }
}

/// Feed an event to the driver and enqueue the resulting actions.
///
/// The driver lock is held until every action is queued. A send that cannot
/// be queued means the target's writer is gone; that is a transport failure
/// for the target, so a `ConnectionClosed` for it is fed back in and
/// cascades like any other disconnect.
async fn dispatch(shared: &SharedState, event: ServerEvent) -> Disposition {
    let origin = event.connection();
    let mut disposition = Disposition::Open;

    let mut driver = shared.driver.lock().await;
    let outbound = shared.outbound.read().await;
    let mut pending = VecDeque::from([event]);

    while let Some(event) = pending.pop_front() {
        let actions = match driver.process_event(event) {
            Ok(actions) => actions,
            Err(e) => {
                tracing::warn!(%origin, "Frame processing error: {}", e);
                disposition = Disposition::Closed;
                continue;
            },
        };

        let mut failed = Vec::new();
        for action in actions {
            match action {
                ServerAction::SendToConnection { connection, message } => {
                    if !deliver(&outbound, connection, Outbound::Text(message.to_string())) {
                        failed.push(connection);
                    }
                },
                ServerAction::SendBinary { connection, data } => {
                    if !deliver(&outbound, connection, Outbound::Binary(data)) {
                        failed.push(connection);
                    }
                },
                ServerAction::Broadcast { connections, message } => {
                    let text = message.to_string();
                    for connection in connections {
                        if !deliver(&outbound, connection, Outbound::Text(text.clone())) {
                            failed.push(connection);
                        }
                    }
                },
                ServerAction::CloseConnection { connection, code, reason } => {
                    tracing::debug!(%connection, ?code, "Closing connection: {}", reason);
                    if connection == origin {
                        disposition = Disposition::Closed;
                    }
                    deliver(&outbound, connection, Outbound::Close { code, reason });
                },
                ServerAction::Log { level, message } => log(level, &message),
            }
        }

        failed.sort_unstable();
        failed.dedup();
        for connection in failed {
            tracing::warn!(%connection, "Send failed, closing connection");
            if connection == origin {
                disposition = Disposition::Closed;
            }
            pending.push_back(ServerEvent::ConnectionClosed {
                connection,
                reason: "send failed".to_string(),
            });
        }
    }

    disposition
}

fn deliver(
    outbound: &HashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>,
    connection: ConnectionId,
    frame: Outbound,
) -> bool {
    outbound.get(&connection).is_some_and(|tx| tx.send(frame).is_ok())
}

fn log(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new(Duration::from_secs(30)))
    }

    fn text(connection: ConnectionId, text: &str) -> ServerEvent {
        ServerEvent::FrameReceived { connection, text: text.to_string() }
    }

    fn next_text(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
        match rx.try_recv() {
            Ok(Outbound::Text(text)) => text,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Register an outbound queue and complete the handshake as `id`.
    async fn register(
        shared: &SharedState,
        id: u64,
        peer: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
        let connection = ConnectionId(id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        shared.outbound.write().await.insert(connection, tx);

        let remote_addr = "127.0.0.1:7000".parse().unwrap();
        dispatch(shared, ServerEvent::ConnectionAccepted { connection, remote_addr }).await;
        dispatch(shared, text(connection, &format!("HELLO {peer}"))).await;
        assert_eq!(next_text(&mut rx), "HELLO");

        (connection, rx)
    }

    #[tokio::test]
    async fn failed_send_tears_down_session() {
        let shared = shared();
        let (a, mut a_rx) = register(&shared, 1, "a").await;
        let (_b, b_rx) = register(&shared, 2, "b").await;

        assert_eq!(dispatch(&shared, text(a, "SESSION b")).await, Disposition::Open);
        assert_eq!(next_text(&mut a_rx), "SESSION_OK");

        // b's writer is gone without a close event
        drop(b_rx);

        let disposition = dispatch(&shared, text(a, "offer-sdp")).await;

        assert_eq!(disposition, Disposition::Closed);
        match a_rx.try_recv() {
            Ok(Outbound::Close { code, reason }) => {
                assert_eq!(code, CloseCode::Normal);
                assert_eq!(reason, "session closed");
            },
            other => panic!("expected close, got {other:?}"),
        }
        assert!(shared.driver.lock().await.registry().is_empty());

        // Both ids are free again
        let (_b2, _b2_rx) = register(&shared, 3, "b").await;
        let (_a2, _a2_rx) = register(&shared, 4, "a").await;
    }

    #[tokio::test]
    async fn failed_broadcast_target_leaves_room() {
        let shared = shared();
        let (a, mut a_rx) = register(&shared, 1, "a").await;
        let (b, b_rx) = register(&shared, 2, "b").await;
        let (c, _c_rx) = register(&shared, 3, "c").await;

        dispatch(&shared, text(a, "ROOM lobby")).await;
        dispatch(&shared, text(b, "ROOM lobby")).await;
        assert_eq!(next_text(&mut a_rx), "ROOM_OK ");
        assert_eq!(next_text(&mut a_rx), "ROOM_PEER_JOINED b");

        drop(b_rx);
        assert_eq!(dispatch(&shared, text(c, "ROOM lobby")).await, Disposition::Open);

        assert_eq!(next_text(&mut a_rx), "ROOM_PEER_JOINED c");
        assert_eq!(next_text(&mut a_rx), "ROOM_PEER_LEFT b");
        let driver = shared.driver.lock().await;
        assert!(!driver.registry().contains("b"));
        assert!(driver.registry().contains("c"));
    }

    #[tokio::test]
    async fn notifications_are_queued_before_state_is_visible() {
        let shared = shared();
        let (a, mut a_rx) = register(&shared, 1, "a").await;
        let (c, _c_rx) = register(&shared, 2, "c").await;
        dispatch(&shared, text(a, "ROOM lobby")).await;
        assert_eq!(next_text(&mut a_rx), "ROOM_OK ");

        // Join stalls until it can enqueue; the driver must stay locked meanwhile
        let queues = shared.outbound.write().await;
        let join = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { dispatch(&shared, text(c, "ROOM lobby")).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        assert!(shared.driver.try_lock().is_err());

        drop(queues);
        join.await.unwrap();

        assert_eq!(next_text(&mut a_rx), "ROOM_PEER_JOINED c");
        let driver = shared.driver.lock().await;
        assert!(driver.rooms().members("lobby").is_some_and(|m| m.len() == 2));
    }

    #[test]
    fn close_codes_map_to_websocket_codes() {
        assert_eq!(ws_close_code(CloseCode::Normal), 1000);
        assert_eq!(ws_close_code(CloseCode::ProtocolError), 1002);
    }
}
