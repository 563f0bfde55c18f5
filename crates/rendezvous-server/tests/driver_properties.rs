//! Property-based tests for SignalingDriver
//!
//! Random sequences of connects, session requests, room joins, messages and
//! disconnects across a small pool of peers and rooms. After every step the
//! driver state must satisfy:
//! - Session entries are symmetric and both sides are in-session
//! - Every room member's status names that room, and vice versa
//! - Every registered peer is reachable through its connection
//! - A frame from an in-session peer is always relayed to its counterpart

use std::{collections::VecDeque, net::SocketAddr};

use proptest::prelude::*;
use rendezvous_server::{
    ConnectionId, PeerStatus, ServerAction, ServerEvent, SignalingDriver,
};

const PEERS: u8 = 5;
const ROOMS: [&str; 2] = ["lobby", "stage"];

#[derive(Debug, Clone)]
enum Op {
    Connect(u8),
    Session(u8, u8),
    Join(u8, usize),
    Send(u8, String),
    PeerMessage(u8, u8),
    PeerList(u8),
    Disconnect(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..PEERS).prop_map(Op::Connect),
        2 => (0..PEERS, 0..PEERS).prop_map(|(a, b)| Op::Session(a, b)),
        2 => (0..PEERS, 0..ROOMS.len()).prop_map(|(a, r)| Op::Join(a, r)),
        2 => (0..PEERS, "[a-zA-Z_ ]{0,12}").prop_map(|(a, t)| Op::Send(a, t)),
        1 => (0..PEERS, 0..PEERS).prop_map(|(a, b)| Op::PeerMessage(a, b)),
        1 => (0..PEERS).prop_map(Op::PeerList),
        1 => (0..PEERS).prop_map(Op::Disconnect),
    ]
}

fn name(slot: u8) -> String {
    format!("p{slot}")
}

struct Harness {
    driver: SignalingDriver,
    slots: [Option<ConnectionId>; PEERS as usize],
    next_connection: u64,
}

impl Harness {
    fn new() -> Self {
        Self { driver: SignalingDriver::new(), slots: [None; PEERS as usize], next_connection: 1 }
    }

    /// Feed one event, then close every connection the driver asked to close,
    /// the way the runtime does. Returns all actions produced.
    fn run(&mut self, event: ServerEvent) -> Vec<ServerAction> {
        let mut all = Vec::new();
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let actions = self.driver.process_event(event).unwrap();
            for action in &actions {
                if let ServerAction::CloseConnection { connection, .. } = action {
                    for slot in &mut self.slots {
                        if *slot == Some(*connection) {
                            *slot = None;
                        }
                    }
                    pending.push_back(ServerEvent::ConnectionClosed {
                        connection: *connection,
                        reason: "closed by server".to_string(),
                    });
                }
            }
            all.extend(actions);
        }

        all
    }

    fn frame(&mut self, slot: u8, text: String) -> Option<Vec<ServerAction>> {
        let connection = self.slots[slot as usize]?;
        Some(self.run(ServerEvent::FrameReceived { connection, text }))
    }

    fn apply(&mut self, op: Op) -> Result<(), TestCaseError> {
        match op {
            Op::Connect(slot) => {
                if self.slots[slot as usize].is_some() {
                    return Ok(());
                }
                let connection = ConnectionId(self.next_connection);
                self.next_connection += 1;
                let remote_addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();
                self.run(ServerEvent::ConnectionAccepted { connection, remote_addr });
                self.slots[slot as usize] = Some(connection);
                self.frame(slot, format!("HELLO {}", name(slot)));
                prop_assert_eq!(self.driver.registry().connection(&name(slot)), Some(connection));
            },
            Op::Session(a, b) => {
                self.frame(a, format!("SESSION {}", name(b)));
            },
            Op::Join(a, room) => {
                self.frame(a, format!("ROOM {}", ROOMS[room]));
            },
            Op::Send(a, text) => {
                let sender = name(a);
                let target = self
                    .driver
                    .sessions()
                    .counterpart(&sender)
                    .and_then(|c| self.driver.registry().connection(c.as_str()));
                let Some(actions) = self.frame(a, text.clone()) else {
                    return Ok(());
                };

                // A session frame is never dropped
                if let Some(target) = target {
                    let relayed = actions.iter().any(|action| matches!(
                        action,
                        ServerAction::SendToConnection { connection, message }
                            if *connection == target && message.to_string() == text
                    ));
                    prop_assert!(relayed);
                }
            },
            Op::PeerMessage(a, b) => {
                self.frame(a, format!("ROOM_PEER_MSG {} hi", name(b)));
            },
            Op::PeerList(a) => {
                self.frame(a, "ROOM_PEER_LIST".to_string());
            },
            Op::Disconnect(slot) => {
                if let Some(connection) = self.slots[slot as usize].take() {
                    self.run(ServerEvent::ConnectionClosed {
                        connection,
                        reason: "client disconnect".to_string(),
                    });
                }
            },
        }
        Ok(())
    }

    fn check_invariants(&self) -> Result<(), TestCaseError> {
        let registry = self.driver.registry();
        let sessions = self.driver.sessions();
        let rooms = self.driver.rooms();

        for (a, b) in sessions.pairs() {
            prop_assert_eq!(sessions.counterpart(b.as_str()), Some(a));
            prop_assert_eq!(registry.status(a.as_str()), Some(&PeerStatus::InSession));
            prop_assert_eq!(registry.status(b.as_str()), Some(&PeerStatus::InSession));
        }

        for (room_id, members) in rooms.rooms() {
            for member in members {
                prop_assert_eq!(
                    registry.status(member.as_str()),
                    Some(&PeerStatus::InRoom(room_id.clone()))
                );
            }
        }

        for (peer, entry) in registry.iter() {
            prop_assert_eq!(self.driver.peer_for(entry.connection), Some(peer));
            match entry.status() {
                PeerStatus::Idle => {
                    prop_assert!(sessions.counterpart(peer.as_str()).is_none());
                },
                PeerStatus::InSession => {
                    prop_assert!(sessions.counterpart(peer.as_str()).is_some());
                },
                PeerStatus::InRoom(room_id) => {
                    prop_assert!(sessions.counterpart(peer.as_str()).is_none());
                    let members = rooms.members(room_id.as_str());
                    prop_assert!(members.is_some_and(|m| m.contains(peer)));
                },
            }
        }

        for (slot, connection) in self.slots.iter().enumerate() {
            if let Some(connection) = connection {
                let expected = name(slot as u8);
                prop_assert_eq!(
                    self.driver.peer_for(*connection).map(|p| p.as_str()),
                    Some(expected.as_str())
                );
            }
        }

        Ok(())
    }
}

proptest! {
    /// Property: state stays consistent under any operation sequence
    #[test]
    fn prop_driver_invariants_hold(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op)?;
            harness.check_invariants()?;
        }
    }

    /// Property: disconnecting everyone empties the registry and sessions
    #[test]
    fn prop_full_disconnect_clears_state(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op)?;
        }
        for slot in 0..PEERS {
            harness.apply(Op::Disconnect(slot))?;
        }

        prop_assert!(harness.driver.registry().is_empty());
        prop_assert_eq!(harness.driver.sessions().session_count(), 0);
        prop_assert_eq!(harness.driver.connection_count(), 0);
        for (_, members) in harness.driver.rooms().rooms() {
            prop_assert!(members.is_empty());
        }
    }
}
