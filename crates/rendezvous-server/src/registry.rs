//! Peer registry.
//!
//! The single source of truth for who is online and what they are doing.
//! Each registered peer maps to its connection, its remote address and its
//! status. The session and room managers read and write status through the
//! registry instead of caching it, so the status field can never drift from
//! their indexes.
//!
//! Peers are keyed by [`PeerId`], but every lookup also accepts the raw token
//! from a frame, so unvalidated ids simply miss.

use std::{collections::HashMap, fmt, net::SocketAddr};

use rendezvous_proto::{PeerId, RoomId};

/// Handle of one transport connection, assigned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a registered peer is currently doing.
///
/// A peer is in at most one session or one room, never both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerStatus {
    /// Registered, not paired, not in a room
    Idle,
    /// Paired with exactly one other peer
    InSession,
    /// Member of the named room
    InRoom(RoomId),
}

impl PeerStatus {
    /// Whether the peer can accept a session or join a room.
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Room the peer belongs to, if any.
    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::InRoom(room_id) => Some(room_id),
            _ => None,
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::InSession => f.write_str("in-session"),
            Self::InRoom(room_id) => write!(f, "in-room:{room_id}"),
        }
    }
}

/// Registry record for one peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// Connection the peer registered on
    pub connection: ConnectionId,
    /// Remote address, for diagnostics only
    pub remote_addr: SocketAddr,
    status: PeerStatus,
}

impl PeerEntry {
    /// Current status.
    pub fn status(&self) -> &PeerStatus {
        &self.status
    }
}

/// Registry of online peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    /// Peer ID → peer record
    peers: HashMap<PeerId, PeerEntry>,
}

impl PeerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer as idle.
    ///
    /// Returns `false` if the id is already taken; the existing record is
    /// left untouched.
    pub fn register(
        &mut self,
        peer: PeerId,
        connection: ConnectionId,
        remote_addr: SocketAddr,
    ) -> bool {
        if self.peers.contains_key(&peer) {
            return false;
        }

        self.peers.insert(peer, PeerEntry { connection, remote_addr, status: PeerStatus::Idle });
        true
    }

    /// Remove a peer. Returns its last record if it was registered.
    pub fn unregister(&mut self, peer: &str) -> Option<PeerEntry> {
        self.peers.remove(peer)
    }

    /// Check if a peer id is taken.
    pub fn contains(&self, peer: &str) -> bool {
        self.peers.contains_key(peer)
    }

    /// Peer record. `None` if not registered.
    pub fn get(&self, peer: &str) -> Option<&PeerEntry> {
        self.peers.get(peer)
    }

    /// Peer record together with the stored id.
    pub fn lookup(&self, peer: &str) -> Option<(&PeerId, &PeerEntry)> {
        self.peers.get_key_value(peer)
    }

    /// Current status. `None` if not registered.
    pub fn status(&self, peer: &str) -> Option<&PeerStatus> {
        self.peers.get(peer).map(PeerEntry::status)
    }

    /// Connection of a registered peer.
    pub fn connection(&self, peer: &str) -> Option<ConnectionId> {
        self.peers.get(peer).map(|entry| entry.connection)
    }

    /// Replace a peer's status.
    ///
    /// Returns `false` if the peer is not registered.
    pub fn set_status(&mut self, peer: &str, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer) {
            Some(entry) => {
                entry.status = status;
                true
            },
            None => false,
        }
    }

    /// All registered peers.
    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &PeerEntry)> {
        self.peers.iter()
    }

    /// Total number of registered peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is registered.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
