//! Rendezvous signaling protocol.
//!
//! Text frames exchanged between browser peers and the relay. Every frame is
//! one message; the relay never interprets the payloads it forwards.
//!
//! # Messages
//!
//! ```text
//! client → server                    server → client
//! ───────────────                    ───────────────
//! HELLO <id>                         HELLO
//! SESSION <callee-id>                SESSION_OK
//! ROOM <room-id>                     ROOM_OK <ids...>
//! ROOM_PEER_MSG <target-id> <text>   ROOM_PEER_JOINED <id>
//! ROOM_PEER_LIST                     ROOM_PEER_LEFT <id>
//!                                    ROOM_PEER_MSG <sender-id> <text>
//!                                    ROOM_PEER_LIST <ids...>
//!                                    ERROR <reason>
//! ```
//!
//! Once two peers are paired by `SESSION`, every frame either of them sends
//! is relayed verbatim to the other.
//!
//! Parsing is status-dependent, so there is no single client message type:
//! [`parse_hello`] handles the handshake, [`IdleRequest`] the requests of an
//! idle peer and [`RoomRequest`] the requests of a room member.

#![forbid(unsafe_code)]

mod id;
mod message;

pub use id::{IdError, PeerId, RoomId, SESSION_MARKER};
pub use message::{HandshakeError, IdleRequest, RoomRequest, ServerMessage, parse_hello};
