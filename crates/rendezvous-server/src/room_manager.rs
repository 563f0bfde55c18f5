//! Room Manager
//!
//! Tracks room membership and routes roster updates and direct messages
//! between members. Rooms are created lazily on first join and are never
//! deleted; an emptied room stays in the index as an empty set.
//!
//! Membership is owned here, status is owned by the registry. Every join and
//! leave updates both in the same call so a member's status always names the
//! room it sits in.

use std::collections::{HashMap, HashSet};

use rendezvous_proto::{PeerId, RoomId, ServerMessage};

use crate::registry::{ConnectionId, PeerRegistry, PeerStatus};

/// Actions returned by RoomManager for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomAction {
    /// Send a frame to one member
    Send {
        /// Recipient connection
        connection: ConnectionId,
        /// Frame to send
        message: ServerMessage,
    },

    /// Send the same frame to several members
    Broadcast {
        /// Recipient connections, in room iteration order
        connections: Vec<ConnectionId>,
        /// Frame to send
        message: ServerMessage,
    },
}

/// Errors from RoomManager operations, reported back to the requesting peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    /// Room id is malformed or reserved
    #[error("invalid room id {0}")]
    InvalidRoomId(String),

    /// Target peer is not registered
    #[error("peer {0} not found")]
    PeerNotFound(String),

    /// Target peer is registered but not in the sender's room
    #[error("peer {0} is not in the room")]
    NotInRoom(String),
}

/// Room membership index.
#[derive(Debug, Default)]
pub struct RoomManager {
    /// Room ID → member peer IDs
    rooms: HashMap<RoomId, HashSet<PeerId>>,
}

impl RoomManager {
    /// Create a new RoomManager
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `peer` to `room_id`, creating the room if needed.
    ///
    /// The joiner gets `ROOM_OK` with the members present before it joined,
    /// then every one of those members gets `ROOM_PEER_JOINED`. The caller
    /// must check that `peer` is idle.
    ///
    /// # Errors
    ///
    /// - `InvalidRoomId` if the id contains whitespace or is reserved
    pub fn join(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        connection: ConnectionId,
        room_id: &str,
    ) -> Result<Vec<RoomAction>, RoomError> {
        let room_id =
            RoomId::parse(room_id).map_err(|_| RoomError::InvalidRoomId(room_id.to_string()))?;

        let members = self.rooms.entry(room_id.clone()).or_default();
        let existing: Vec<PeerId> = members.iter().filter(|m| *m != peer).cloned().collect();

        let mut actions =
            vec![RoomAction::Send { connection, message: ServerMessage::RoomOk(existing.clone()) }];

        registry.set_status(peer.as_str(), PeerStatus::InRoom(room_id));
        members.insert(peer.clone());

        let connections: Vec<ConnectionId> =
            existing.iter().filter_map(|m| registry.connection(m.as_str())).collect();
        if !connections.is_empty() {
            actions.push(RoomAction::Broadcast {
                connections,
                message: ServerMessage::RoomPeerJoined(peer.clone()),
            });
        }

        Ok(actions)
    }

    /// Deliver a direct message from `sender` to `target` within `room_id`.
    ///
    /// # Errors
    ///
    /// - `PeerNotFound` if the target is not registered
    /// - `NotInRoom` if the target is not a member of `room_id`
    pub fn route_direct(
        &self,
        registry: &PeerRegistry,
        sender: &PeerId,
        room_id: &RoomId,
        target: &str,
        text: &str,
    ) -> Result<RoomAction, RoomError> {
        let Some(entry) = registry.get(target) else {
            return Err(RoomError::PeerNotFound(target.to_string()));
        };
        if entry.status().room() != Some(room_id) {
            return Err(RoomError::NotInRoom(target.to_string()));
        }

        Ok(RoomAction::Send {
            connection: entry.connection,
            message: ServerMessage::RoomPeerMessage {
                sender: sender.clone(),
                text: text.to_string(),
            },
        })
    }

    /// Roster of `room_id` as seen by `peer`, excluding `peer` itself.
    pub fn list_peers(&self, peer: &PeerId, connection: ConnectionId, room_id: &RoomId) -> RoomAction {
        let others = self
            .rooms
            .get(room_id)
            .map(|members| members.iter().filter(|m| *m != peer).cloned().collect())
            .unwrap_or_default();

        RoomAction::Send { connection, message: ServerMessage::RoomPeerList(others) }
    }

    /// Remove `peer` from `room_id` and tell the remaining members.
    ///
    /// No-op if the peer is not a member, so a second cleanup pass is
    /// harmless. The room entry is kept even when it becomes empty.
    pub fn leave(
        &mut self,
        registry: &mut PeerRegistry,
        peer: &PeerId,
        room_id: &RoomId,
    ) -> Vec<RoomAction> {
        let Some(members) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        if !members.remove(peer) {
            return Vec::new();
        }

        if registry.status(peer.as_str()).and_then(PeerStatus::room) == Some(room_id) {
            registry.set_status(peer.as_str(), PeerStatus::Idle);
        }

        let connections: Vec<ConnectionId> =
            members.iter().filter_map(|m| registry.connection(m.as_str())).collect();
        if connections.is_empty() {
            return Vec::new();
        }

        vec![RoomAction::Broadcast { connections, message: ServerMessage::RoomPeerLeft(peer.clone()) }]
    }

    /// Members of a room. `None` if the room was never joined.
    pub fn members(&self, room_id: &str) -> Option<&HashSet<PeerId>> {
        self.rooms.get(room_id)
    }

    /// All rooms ever joined, including empty ones.
    pub fn rooms(&self) -> impl Iterator<Item = (&RoomId, &HashSet<PeerId>)> {
        self.rooms.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::parse(id).unwrap()
    }

    fn room(id: &str) -> RoomId {
        RoomId::parse(id).unwrap()
    }

    fn setup(ids: &[&str]) -> PeerRegistry {
        let addr: SocketAddr = "127.0.0.1:6000".parse().unwrap();
        let mut registry = PeerRegistry::new();
        for (i, id) in ids.iter().enumerate() {
            registry.register(peer(id), ConnectionId(i as u64 + 1), addr);
        }
        registry
    }

    fn sorted(mut peers: Vec<PeerId>) -> Vec<PeerId> {
        peers.sort();
        peers
    }

    #[test]
    fn first_join_creates_room() {
        let mut registry = setup(&["a"]);
        let mut rooms = RoomManager::new();

        let actions = rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();

        assert_eq!(actions, vec![RoomAction::Send {
            connection: ConnectionId(1),
            message: ServerMessage::RoomOk(vec![]),
        }]);
        assert_eq!(registry.status("a"), Some(&PeerStatus::InRoom(room("lobby"))));
        assert!(rooms.members("lobby").unwrap().contains("a"));
    }

    #[test]
    fn join_reports_existing_members_and_broadcasts() {
        let mut registry = setup(&["a", "b", "c"]);
        let mut rooms = RoomManager::new();
        rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();
        rooms.join(&mut registry, &peer("b"), ConnectionId(2), "lobby").unwrap();

        let actions = rooms.join(&mut registry, &peer("c"), ConnectionId(3), "lobby").unwrap();

        let RoomAction::Send { connection, message: ServerMessage::RoomOk(roster) } = &actions[0] else {
            panic!("expected ROOM_OK, got {actions:?}");
        };
        assert_eq!(*connection, ConnectionId(3));
        assert_eq!(sorted(roster.clone()), vec![peer("a"), peer("b")]);

        let RoomAction::Broadcast { connections, message } = &actions[1] else {
            panic!("expected broadcast, got {actions:?}");
        };
        let mut connections = connections.clone();
        connections.sort();
        assert_eq!(connections, vec![ConnectionId(1), ConnectionId(2)]);
        assert_eq!(message, &ServerMessage::RoomPeerJoined(peer("c")));
    }

    #[test]
    fn join_rejects_bad_room_ids() {
        let mut registry = setup(&["a"]);
        let mut rooms = RoomManager::new();

        for bad in ["session", "two words"] {
            let err = rooms.join(&mut registry, &peer("a"), ConnectionId(1), bad).unwrap_err();
            assert_eq!(err, RoomError::InvalidRoomId(bad.to_string()));
        }
        assert_eq!(
            RoomError::InvalidRoomId("session".into()).to_string(),
            "invalid room id session"
        );
        assert_eq!(registry.status("a"), Some(&PeerStatus::Idle));
        assert_eq!(rooms.rooms().count(), 0);
    }

    #[test]
    fn route_direct_within_room() {
        let mut registry = setup(&["a", "b"]);
        let mut rooms = RoomManager::new();
        rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();
        rooms.join(&mut registry, &peer("b"), ConnectionId(2), "lobby").unwrap();

        let action = rooms.route_direct(&registry, &peer("a"), &room("lobby"), "b", "ice 1 2").unwrap();

        assert_eq!(action, RoomAction::Send {
            connection: ConnectionId(2),
            message: ServerMessage::RoomPeerMessage { sender: peer("a"), text: "ice 1 2".into() },
        });
    }

    #[test]
    fn route_direct_errors() {
        let mut registry = setup(&["a", "b", "c"]);
        let mut rooms = RoomManager::new();
        rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();
        rooms.join(&mut registry, &peer("b"), ConnectionId(2), "other").unwrap();

        let err = rooms.route_direct(&registry, &peer("a"), &room("lobby"), "ghost", "x").unwrap_err();
        assert_eq!(err.to_string(), "peer ghost not found");

        let err = rooms.route_direct(&registry, &peer("a"), &room("lobby"), "b", "x").unwrap_err();
        assert_eq!(err.to_string(), "peer b is not in the room");

        // Idle peers are not in any room
        let err = rooms.route_direct(&registry, &peer("a"), &room("lobby"), "c", "x").unwrap_err();
        assert_eq!(err, RoomError::NotInRoom("c".into()));
    }

    #[test]
    fn list_peers_excludes_requester() {
        let mut registry = setup(&["a", "b"]);
        let mut rooms = RoomManager::new();
        rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();

        assert_eq!(rooms.list_peers(&peer("a"), ConnectionId(1), &room("lobby")), RoomAction::Send {
            connection: ConnectionId(1),
            message: ServerMessage::RoomPeerList(vec![]),
        });

        rooms.join(&mut registry, &peer("b"), ConnectionId(2), "lobby").unwrap();
        assert_eq!(rooms.list_peers(&peer("a"), ConnectionId(1), &room("lobby")), RoomAction::Send {
            connection: ConnectionId(1),
            message: ServerMessage::RoomPeerList(vec![peer("b")]),
        });
    }

    #[test]
    fn leave_notifies_remaining_members() {
        let mut registry = setup(&["a", "b", "c"]);
        let mut rooms = RoomManager::new();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            rooms.join(&mut registry, &peer(id), ConnectionId(i as u64 + 1), "lobby").unwrap();
        }

        let actions = rooms.leave(&mut registry, &peer("b"), &room("lobby"));

        let [RoomAction::Broadcast { connections, message }] = actions.as_slice() else {
            panic!("expected one broadcast, got {actions:?}");
        };
        let mut connections = connections.clone();
        connections.sort();
        assert_eq!(connections, vec![ConnectionId(1), ConnectionId(3)]);
        assert_eq!(message, &ServerMessage::RoomPeerLeft(peer("b")));
        assert_eq!(registry.status("b"), Some(&PeerStatus::Idle));
    }

    #[test]
    fn leave_is_idempotent_and_keeps_empty_room() {
        let mut registry = setup(&["a"]);
        let mut rooms = RoomManager::new();
        rooms.join(&mut registry, &peer("a"), ConnectionId(1), "lobby").unwrap();

        assert!(rooms.leave(&mut registry, &peer("a"), &room("lobby")).is_empty());
        assert!(rooms.leave(&mut registry, &peer("a"), &room("lobby")).is_empty());
        assert!(rooms.leave(&mut registry, &peer("a"), &room("nowhere")).is_empty());

        assert!(rooms.members("lobby").unwrap().is_empty());
    }
}
