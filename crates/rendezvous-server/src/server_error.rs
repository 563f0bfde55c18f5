//! Driver error types.
//!
//! Routing failures (unknown target, busy peer, bad room id) are not errors
//! at this level: the driver answers them with an `ERROR` frame. What remains
//! are events the runtime should not have produced, or state that disagrees
//! with itself. Either way the connection involved is torn down.

use std::fmt;

use rendezvous_proto::PeerId;

use crate::registry::ConnectionId;

/// Errors from [`SignalingDriver::process_event`](crate::SignalingDriver::process_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Connection not known to the driver.
    ///
    /// The runtime delivered a frame for a connection that was never
    /// accepted, or that the driver already closed. Usually a frame racing a
    /// close; the runtime stops reading from the connection.
    ConnectionNotFound(ConnectionId),

    /// Peer is marked in-session but has no session index entry.
    ///
    /// The two indexes disagree. This is a bug; the runtime drops the frame
    /// and runs cleanup for the connection.
    SessionMissing(PeerId),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound(id) => write!(f, "connection not found: {id}"),
            Self::SessionMissing(peer) => write!(f, "peer {peer} is in-session without a counterpart"),
        }
    }
}

impl std::error::Error for DriverError {}
