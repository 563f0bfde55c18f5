//! Signaling driver.
//!
//! The protocol state machine for every connection. Ties together the peer
//! registry, the session manager and the room manager behind one
//! `process_event` entry point. The driver performs no I/O: the runtime feeds
//! it [`ServerEvent`]s and executes the [`ServerAction`]s it returns, so every
//! compound transition (handshake, session setup, cleanup cascade) is applied
//! in a single call while the runtime holds the driver lock.

use std::{collections::HashMap, net::SocketAddr};

use bytes::Bytes;
use rendezvous_proto::{
    HandshakeError, IdleRequest, PeerId, RoomRequest, ServerMessage, parse_hello,
};

use crate::{
    registry::{ConnectionId, PeerRegistry, PeerStatus},
    room_manager::{RoomAction, RoomManager},
    server_error::DriverError,
    session_manager::{SessionAction, SessionManager},
};

/// Reason attached to the close of a peer whose session counterpart left.
const SESSION_CLOSED: &str = "session closed";

/// Reason attached to the close that ends a cleanup cascade.
const CONNECTION_CLOSED: &str = "connection closed";

/// Events that the driver processes.
///
/// Produced by the transport runtime, or directly by tests.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection finished its transport handshake
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        connection: ConnectionId,
        /// Remote address, for diagnostics
        remote_addr: SocketAddr,
    },

    /// A text frame arrived on a connection
    FrameReceived {
        /// Connection that sent the frame
        connection: ConnectionId,
        /// Frame contents
        text: String,
    },

    /// A binary frame arrived on a connection
    BinaryReceived {
        /// Connection that sent the frame
        connection: ConnectionId,
        /// Frame contents
        data: Bytes,
    },

    /// A connection ended (peer close, read error, failed send)
    ConnectionClosed {
        /// Connection that ended
        connection: ConnectionId,
        /// Reason for closure
        reason: String,
    },
}

impl ServerEvent {
    /// Connection the event concerns.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::ConnectionAccepted { connection, .. }
            | Self::FrameReceived { connection, .. }
            | Self::BinaryReceived { connection, .. }
            | Self::ConnectionClosed { connection, .. } => *connection,
        }
    }
}

/// Close codes the driver asks the transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Ordinary close
    Normal,
    /// Handshake violated the protocol
    ProtocolError,
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Actions that the driver produces.
///
/// The runtime enqueues them while it still holds the driver lock, so
/// notifications reach the outbound queues in the order the state changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Send a frame to one connection
    SendToConnection {
        /// Target connection
        connection: ConnectionId,
        /// Frame to send
        message: ServerMessage,
    },

    /// Relay a binary frame to one connection
    SendBinary {
        /// Target connection
        connection: ConnectionId,
        /// Frame contents, unchanged
        data: Bytes,
    },

    /// Send the same frame to several connections
    Broadcast {
        /// Target connections
        connections: Vec<ConnectionId>,
        /// Frame to send
        message: ServerMessage,
    },

    /// Close a connection
    CloseConnection {
        /// Connection to close
        connection: ConnectionId,
        /// Close code
        code: CloseCode,
        /// Reason sent in the close frame
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone)]
enum ConnectionPhase {
    /// Accepted, waiting for `HELLO`
    AwaitingHello { remote_addr: SocketAddr },
    /// Handshake done, peer registered
    Registered { peer: PeerId },
}

/// Action-based signaling driver.
#[derive(Debug, Default)]
pub struct SignalingDriver {
    /// Live connections (connection → phase)
    connections: HashMap<ConnectionId, ConnectionPhase>,
    /// Who is online and what they are doing
    registry: PeerRegistry,
    /// Symmetric session index
    sessions: SessionManager,
    /// Room membership
    rooms: RoomManager,
}

impl SignalingDriver {
    /// Create an empty driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the driver.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction>, DriverError> {
        match event {
            ServerEvent::ConnectionAccepted { connection, remote_addr } => {
                Ok(self.handle_connection_accepted(connection, remote_addr))
            },
            ServerEvent::FrameReceived { connection, text } => {
                self.handle_frame_received(connection, text)
            },
            ServerEvent::BinaryReceived { connection, data } => {
                self.handle_binary_received(connection, data)
            },
            ServerEvent::ConnectionClosed { connection, reason } => {
                Ok(self.handle_connection_closed(connection, &reason))
            },
        }
    }

    fn handle_connection_accepted(
        &mut self,
        connection: ConnectionId,
        remote_addr: SocketAddr,
    ) -> Vec<ServerAction> {
        self.connections.insert(connection, ConnectionPhase::AwaitingHello { remote_addr });

        vec![ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("connection {connection} accepted from {remote_addr}"),
        }]
    }

    fn handle_frame_received(
        &mut self,
        connection: ConnectionId,
        text: String,
    ) -> Result<Vec<ServerAction>, DriverError> {
        match self.connections.get(&connection) {
            None => Err(DriverError::ConnectionNotFound(connection)),
            Some(ConnectionPhase::AwaitingHello { remote_addr }) => {
                let remote_addr = *remote_addr;
                Ok(self.handle_hello(connection, remote_addr, &text))
            },
            Some(ConnectionPhase::Registered { peer }) => {
                let peer = peer.clone();
                self.dispatch(connection, &peer, text)
            },
        }
    }

    /// Binary frames carry no protocol requests. Before the handshake one is
    /// a violation; in a session it is relayed like any other frame.
    fn handle_binary_received(
        &mut self,
        connection: ConnectionId,
        data: Bytes,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let peer = match self.connections.get(&connection) {
            None => return Err(DriverError::ConnectionNotFound(connection)),
            Some(ConnectionPhase::AwaitingHello { remote_addr }) => {
                let remote_addr = *remote_addr;
                let err = HandshakeError::NotHello(format!("<{} binary bytes>", data.len()));
                return Ok(self.reject_handshake(
                    connection,
                    err.close_reason(),
                    format!("handshake from {remote_addr} rejected: {err}"),
                ));
            },
            Some(ConnectionPhase::Registered { peer }) => peer.clone(),
        };

        match self.registry.status(peer.as_str()) {
            Some(PeerStatus::InSession) => {
                let target = self
                    .sessions
                    .counterpart_connection(&self.registry, peer.as_str())
                    .ok_or_else(|| DriverError::SessionMissing(peer.clone()))?;
                Ok(vec![ServerAction::SendBinary { connection: target, data }])
            },
            Some(PeerStatus::InRoom(_)) => Ok(vec![ServerAction::SendToConnection {
                connection,
                message: ServerMessage::invalid_room_message(),
            }]),
            Some(PeerStatus::Idle) | None => Ok(vec![ServerAction::Log {
                level: LogLevel::Debug,
                message: format!("ignoring {}-byte binary frame from {peer}", data.len()),
            }]),
        }
    }

    /// Validate the first frame and register the peer.
    ///
    /// Any failure closes the connection with a protocol error and leaves no
    /// trace in the registry.
    fn handle_hello(
        &mut self,
        connection: ConnectionId,
        remote_addr: SocketAddr,
        text: &str,
    ) -> Vec<ServerAction> {
        let peer = match parse_hello(text) {
            Ok(peer) => peer,
            Err(err) => {
                return self.reject_handshake(
                    connection,
                    err.close_reason(),
                    format!("handshake from {remote_addr} rejected: {err}"),
                );
            },
        };

        if !self.registry.register(peer.clone(), connection, remote_addr) {
            return self.reject_handshake(
                connection,
                "invalid peer uid",
                format!("handshake from {remote_addr} rejected: peer {peer} already registered"),
            );
        }

        self.connections.insert(connection, ConnectionPhase::Registered { peer: peer.clone() });

        vec![
            ServerAction::SendToConnection { connection, message: ServerMessage::Hello },
            ServerAction::Log {
                level: LogLevel::Info,
                message: format!("registered peer {peer} at {remote_addr}"),
            },
        ]
    }

    fn reject_handshake(
        &mut self,
        connection: ConnectionId,
        reason: &str,
        log: String,
    ) -> Vec<ServerAction> {
        self.connections.remove(&connection);

        vec![
            ServerAction::Log { level: LogLevel::Warn, message: log },
            ServerAction::CloseConnection {
                connection,
                code: CloseCode::ProtocolError,
                reason: reason.to_string(),
            },
        ]
    }

    /// Route a frame from a registered peer by its current status.
    ///
    /// Status is read from the registry every time since another peer's
    /// request may have changed it since the last frame.
    fn dispatch(
        &mut self,
        connection: ConnectionId,
        peer: &PeerId,
        text: String,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let Some(status) = self.registry.status(peer.as_str()).cloned() else {
            return Ok(vec![ServerAction::Log {
                level: LogLevel::Warn,
                message: format!("dropping frame from unregistered peer {peer}"),
            }]);
        };

        match status {
            PeerStatus::Idle => Ok(self.dispatch_idle(connection, peer, &text)),
            PeerStatus::InSession => self.dispatch_session(peer, text),
            PeerStatus::InRoom(room_id) => {
                let action = match RoomRequest::parse(&text) {
                    RoomRequest::PeerMessage { target, text } => {
                        match self.rooms.route_direct(&self.registry, peer, &room_id, target, text) {
                            Ok(action) => action,
                            Err(err) => return Ok(error_reply(connection, &err)),
                        }
                    },
                    RoomRequest::PeerList => self.rooms.list_peers(peer, connection, &room_id),
                    RoomRequest::Invalid => RoomAction::Send {
                        connection,
                        message: ServerMessage::invalid_room_message(),
                    },
                };
                Ok(vec![convert_room_action(action)])
            },
        }
    }

    fn dispatch_idle(
        &mut self,
        connection: ConnectionId,
        peer: &PeerId,
        text: &str,
    ) -> Vec<ServerAction> {
        match IdleRequest::parse(text) {
            IdleRequest::Session { callee } => {
                match self.sessions.open_session(&mut self.registry, peer, connection, callee) {
                    Ok(session_actions) => {
                        let mut actions = self.convert_session_actions(session_actions);
                        actions.push(ServerAction::Log {
                            level: LogLevel::Info,
                            message: format!("session {peer} <-> {callee} established"),
                        });
                        actions
                    },
                    Err(err) => error_reply(connection, &err),
                }
            },
            IdleRequest::Room { room_id } => {
                match self.rooms.join(&mut self.registry, peer, connection, room_id) {
                    Ok(room_actions) => {
                        let mut actions: Vec<ServerAction> =
                            room_actions.into_iter().map(convert_room_action).collect();
                        actions.push(ServerAction::Log {
                            level: LogLevel::Info,
                            message: format!("peer {peer} joined room {room_id}"),
                        });
                        actions
                    },
                    Err(err) => error_reply(connection, &err),
                }
            },
            IdleRequest::Unknown => vec![ServerAction::Log {
                level: LogLevel::Debug,
                message: format!("ignoring unknown message from idle peer {peer}"),
            }],
        }
    }

    fn dispatch_session(
        &mut self,
        peer: &PeerId,
        text: String,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let counterpart = self
            .sessions
            .counterpart(peer.as_str())
            .cloned()
            .ok_or_else(|| DriverError::SessionMissing(peer.clone()))?;
        let action = self
            .sessions
            .forward(&self.registry, peer.as_str(), text)
            .ok_or_else(|| DriverError::SessionMissing(peer.clone()))?;

        let mut actions = self.convert_session_actions(vec![action]);
        actions.push(ServerAction::Log {
            level: LogLevel::Debug,
            message: format!("{peer} -> {counterpart}"),
        });
        Ok(actions)
    }

    /// Run the cleanup cascade for a connection that ended.
    ///
    /// Order is fixed: session teardown, room leave, unregister, close. A
    /// connection the driver no longer tracks is a no-op, which makes a
    /// repeated close harmless.
    fn handle_connection_closed(&mut self, connection: ConnectionId, reason: &str) -> Vec<ServerAction> {
        let Some(phase) = self.connections.remove(&connection) else {
            return Vec::new();
        };

        let peer = match phase {
            ConnectionPhase::AwaitingHello { remote_addr } => {
                return vec![ServerAction::Log {
                    level: LogLevel::Debug,
                    message: format!(
                        "connection {connection} from {remote_addr} closed before handshake: {reason}"
                    ),
                }];
            },
            ConnectionPhase::Registered { peer } => peer,
        };

        let session_actions = self.sessions.close_session(&mut self.registry, peer.as_str());
        let mut actions = self.convert_session_actions(session_actions);

        if let Some(room_id) = self.registry.status(peer.as_str()).and_then(PeerStatus::room).cloned() {
            actions.extend(
                self.rooms.leave(&mut self.registry, &peer, &room_id).into_iter().map(convert_room_action),
            );
        }

        self.registry.unregister(peer.as_str());

        actions.push(ServerAction::Log {
            level: LogLevel::Info,
            message: format!("peer {peer} disconnected: {reason}"),
        });
        actions.push(ServerAction::CloseConnection {
            connection,
            code: CloseCode::Normal,
            reason: CONNECTION_CLOSED.to_string(),
        });
        actions
    }

    fn convert_session_actions(&mut self, session_actions: Vec<SessionAction>) -> Vec<ServerAction> {
        let mut actions = Vec::with_capacity(session_actions.len());
        for action in session_actions {
            match action {
                SessionAction::Send { connection, message } => {
                    actions.push(ServerAction::SendToConnection { connection, message });
                },
                SessionAction::Close { peer, connection } => {
                    // Already unregistered by the session manager; its own
                    // close event will find nothing left to clean up.
                    self.connections.remove(&connection);
                    actions.push(ServerAction::Log {
                        level: LogLevel::Info,
                        message: format!("closing peer {peer}: session counterpart left"),
                    });
                    actions.push(ServerAction::CloseConnection {
                        connection,
                        code: CloseCode::Normal,
                        reason: SESSION_CLOSED.to_string(),
                    });
                },
            }
        }
        actions
    }

    /// Peer registry.
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Session index.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Room membership.
    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// Peer registered on a connection, if the handshake completed.
    pub fn peer_for(&self, connection: ConnectionId) -> Option<&PeerId> {
        match self.connections.get(&connection)? {
            ConnectionPhase::Registered { peer } => Some(peer),
            ConnectionPhase::AwaitingHello { .. } => None,
        }
    }

    /// Number of connections the driver is tracking.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

fn convert_room_action(action: RoomAction) -> ServerAction {
    match action {
        RoomAction::Send { connection, message } => {
            ServerAction::SendToConnection { connection, message }
        },
        RoomAction::Broadcast { connections, message } => {
            ServerAction::Broadcast { connections, message }
        },
    }
}

fn error_reply(connection: ConnectionId, err: &impl std::error::Error) -> Vec<ServerAction> {
    vec![ServerAction::SendToConnection {
        connection,
        message: ServerMessage::Error(err.to_string()),
    }]
}
