//! Session management.
//!
//! A session pairs two peers for verbatim relay. The index stores both
//! directions so either side finds its counterpart in one lookup, and every
//! mutation touches both directions together.
//!
//! Like the room manager, this returns actions instead of performing I/O. The
//! driver turns them into [`ServerAction`](crate::ServerAction)s.

use std::collections::HashMap;

use rendezvous_proto::{PeerId, ServerMessage};
use thiserror::Error;

use crate::registry::{ConnectionId, PeerRegistry, PeerStatus};

/// Session routing errors, reported back to the requesting peer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Callee is not registered
    #[error("peer {0} not found")]
    PeerNotFound(String),

    /// Caller or callee is not idle
    #[error("peer {0} busy")]
    PeerBusy(String),
}

/// Effects of a session operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Send a frame to one connection
    Send {
        /// Recipient connection
        connection: ConnectionId,
        /// Frame to send
        message: ServerMessage,
    },

    /// Hard-disconnect a peer whose counterpart went away.
    ///
    /// The peer has already been removed from the registry.
    Close {
        /// Peer that lost its counterpart
        peer: PeerId,
        /// Its connection
        connection: ConnectionId,
    },
}

/// Symmetric session index.
#[derive(Debug, Default)]
pub struct SessionManager {
    /// Peer → counterpart, stored in both directions
    sessions: HashMap<PeerId, PeerId>,
}

impl SessionManager {
    /// Create a new session manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair `caller` with `callee`.
    ///
    /// Both peers must be registered and idle, and must be distinct. On
    /// success both become [`PeerStatus::InSession`], both index entries are
    /// recorded and the caller gets `SESSION_OK`. On failure nothing changes.
    ///
    /// # Errors
    ///
    /// - `PeerNotFound` if the callee is not registered
    /// - `PeerBusy` if the callee is the caller, or either side is not idle
    pub fn open_session(
        &mut self,
        registry: &mut PeerRegistry,
        caller: &PeerId,
        caller_connection: ConnectionId,
        callee: &str,
    ) -> Result<Vec<SessionAction>, SessionError> {
        let Some((callee_id, callee_entry)) = registry.lookup(callee) else {
            return Err(SessionError::PeerNotFound(callee.to_string()));
        };

        if callee_id == caller || !callee_entry.status().is_idle() {
            return Err(SessionError::PeerBusy(callee.to_string()));
        }
        if !registry.status(caller.as_str()).is_some_and(PeerStatus::is_idle) {
            return Err(SessionError::PeerBusy(caller.to_string()));
        }

        let callee_id = callee_id.clone();
        registry.set_status(caller.as_str(), PeerStatus::InSession);
        registry.set_status(callee_id.as_str(), PeerStatus::InSession);
        self.sessions.insert(caller.clone(), callee_id.clone());
        self.sessions.insert(callee_id, caller.clone());

        Ok(vec![SessionAction::Send {
            connection: caller_connection,
            message: ServerMessage::SessionOk,
        }])
    }

    /// Counterpart of a paired peer.
    pub fn counterpart(&self, peer: &str) -> Option<&PeerId> {
        self.sessions.get(peer)
    }

    /// Connection of the peer's counterpart.
    pub fn counterpart_connection(&self, registry: &PeerRegistry, peer: &str) -> Option<ConnectionId> {
        let counterpart = self.sessions.get(peer)?;
        registry.connection(counterpart.as_str())
    }

    /// Forward a frame verbatim to the sender's counterpart.
    ///
    /// Returns `None` if the sender is not paired or the counterpart has no
    /// registry record.
    pub fn forward(
        &self,
        registry: &PeerRegistry,
        sender: &str,
        text: String,
    ) -> Option<SessionAction> {
        let connection = self.counterpart_connection(registry, sender)?;
        Some(SessionAction::Send { connection, message: ServerMessage::Relay(text) })
    }

    /// Tear down the session `peer` belongs to.
    ///
    /// Removes both index entries and returns `peer` to idle. The counterpart
    /// is unregistered and a [`SessionAction::Close`] is returned for it, since
    /// the protocol has no way to end a session without a disconnect. No-op if
    /// `peer` is not paired, so repeated cleanup is harmless.
    pub fn close_session(&mut self, registry: &mut PeerRegistry, peer: &str) -> Vec<SessionAction> {
        let Some(counterpart) = self.sessions.remove(peer) else {
            return Vec::new();
        };
        self.sessions.remove(counterpart.as_str());

        if registry.status(peer) == Some(&PeerStatus::InSession) {
            registry.set_status(peer, PeerStatus::Idle);
        }

        registry
            .unregister(counterpart.as_str())
            .map(|entry| SessionAction::Close { peer: counterpart, connection: entry.connection })
            .into_iter()
            .collect()
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len() / 2
    }

    /// All directed index entries.
    pub fn pairs(&self) -> impl Iterator<Item = (&PeerId, &PeerId)> {
        self.sessions.iter()
    }
}
