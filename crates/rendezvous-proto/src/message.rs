//! Request parsing and server message rendering.
//!
//! A keyword must be the whole first token of a frame (`SESSIONX b` is not a
//! session request). The argument is the rest of the frame with leading
//! whitespace removed, so ids carrying inner or trailing whitespace reach
//! validation and fail there instead of being silently truncated.

use std::fmt;

use thiserror::Error;

use crate::id::{IdError, PeerId};

const HELLO: &str = "HELLO";
const SESSION: &str = "SESSION";
const SESSION_OK: &str = "SESSION_OK";
const ROOM: &str = "ROOM";
const ROOM_OK: &str = "ROOM_OK";
const ROOM_PEER_JOINED: &str = "ROOM_PEER_JOINED";
const ROOM_PEER_LEFT: &str = "ROOM_PEER_LEFT";
const ROOM_PEER_MSG: &str = "ROOM_PEER_MSG";
const ROOM_PEER_LIST: &str = "ROOM_PEER_LIST";
const ERROR: &str = "ERROR";

/// Reply to a room member whose frame is not a room request.
const INVALID_ROOM_MSG: &str = "invalid msg, already in room";

/// Split off the first whitespace-delimited token.
fn split_token(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(end) => (&text[..end], text[end..].trim_start()),
        None => (text, ""),
    }
}

/// Handshake failures. Fatal for the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// First frame did not start with `HELLO`
    #[error("expected HELLO, got {0:?}")]
    NotHello(String),

    /// `HELLO` carried an unusable peer id
    #[error("invalid peer id: {0}")]
    InvalidPeerId(#[from] IdError),
}

impl HandshakeError {
    /// Reason sent in the close frame.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::NotHello(_) => "invalid protocol",
            Self::InvalidPeerId(_) => "invalid peer uid",
        }
    }
}

/// Parse the `HELLO <id>` handshake frame.
///
/// Uniqueness of the id is not checked here; that needs the registry.
pub fn parse_hello(text: &str) -> Result<PeerId, HandshakeError> {
    let (keyword, id) = split_token(text);
    if keyword != HELLO {
        return Err(HandshakeError::NotHello(keyword.to_string()));
    }
    Ok(PeerId::parse(id)?)
}

/// Requests understood from a peer that is neither paired nor in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleRequest<'a> {
    /// `SESSION <callee-id>`
    Session {
        /// Raw callee id, unvalidated
        callee: &'a str,
    },

    /// `ROOM <room-id>`
    Room {
        /// Raw room id, unvalidated
        room_id: &'a str,
    },

    /// Anything else. Ignored for forward compatibility.
    Unknown,
}

impl<'a> IdleRequest<'a> {
    /// Classify a frame from an idle peer.
    pub fn parse(text: &'a str) -> Self {
        match split_token(text) {
            (SESSION, callee) if !callee.is_empty() => Self::Session { callee },
            (ROOM, room_id) if !room_id.is_empty() => Self::Room { room_id },
            _ => Self::Unknown,
        }
    }
}

/// Requests understood from a room member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRequest<'a> {
    /// `ROOM_PEER_MSG <target-id> <text>`
    PeerMessage {
        /// Raw target id, unvalidated
        target: &'a str,
        /// Opaque payload
        text: &'a str,
    },

    /// `ROOM_PEER_LIST`
    PeerList,

    /// Anything else. Answered with an error.
    Invalid,
}

impl<'a> RoomRequest<'a> {
    /// Classify a frame from a room member.
    pub fn parse(text: &'a str) -> Self {
        if text == ROOM_PEER_LIST {
            return Self::PeerList;
        }
        let (keyword, rest) = split_token(text);
        if keyword != ROOM_PEER_MSG {
            return Self::Invalid;
        }
        match split_token(rest) {
            (target, body) if !target.is_empty() && !body.is_empty() => {
                Self::PeerMessage { target, text: body }
            },
            _ => Self::Invalid,
        }
    }
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Handshake accepted
    Hello,

    /// Session request accepted
    SessionOk,

    /// Frame from a session counterpart, forwarded verbatim
    Relay(String),

    /// Room joined; members that were present before the join
    RoomOk(Vec<PeerId>),

    /// Another peer joined the recipient's room
    RoomPeerJoined(PeerId),

    /// Another peer left the recipient's room
    RoomPeerLeft(PeerId),

    /// Direct message from a member of the same room
    RoomPeerMessage {
        /// Member that sent the message
        sender: PeerId,
        /// Opaque payload
        text: String,
    },

    /// Roster reply, excluding the requester
    RoomPeerList(Vec<PeerId>),

    /// Recoverable request failure
    Error(String),
}

impl ServerMessage {
    /// Error reply for a room member sending something other than a room
    /// request.
    pub fn invalid_room_message() -> Self {
        Self::Error(INVALID_ROOM_MSG.to_string())
    }
}

fn write_roster(f: &mut fmt::Formatter<'_>, keyword: &str, peers: &[PeerId]) -> fmt::Result {
    write!(f, "{keyword} ")?;
    for (i, peer) in peers.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        f.write_str(peer.as_str())?;
    }
    Ok(())
}

impl fmt::Display for ServerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello => f.write_str(HELLO),
            Self::SessionOk => f.write_str(SESSION_OK),
            Self::Relay(text) => f.write_str(text),
            Self::RoomOk(peers) => write_roster(f, ROOM_OK, peers),
            Self::RoomPeerJoined(peer) => write!(f, "{ROOM_PEER_JOINED} {peer}"),
            Self::RoomPeerLeft(peer) => write!(f, "{ROOM_PEER_LEFT} {peer}"),
            Self::RoomPeerMessage { sender, text } => write!(f, "{ROOM_PEER_MSG} {sender} {text}"),
            Self::RoomPeerList(peers) => write_roster(f, ROOM_PEER_LIST, peers),
            Self::Error(reason) => write!(f, "{ERROR} {reason}"),
        }
    }
}
