//! Server error types.

use std::fmt;

/// Errors that can occur in the server runtime.
///
/// Protocol state machine failures are [`DriverError`](crate::DriverError)s
/// and stay inside the connection that caused them.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, health path, unreadable
    /// TLS material).
    ///
    /// These are fatal errors that prevent server startup. Fix configuration
    /// and restart.
    Config(String),

    /// Transport/network error (bind failure, accept failure, I/O error).
    ///
    /// Fatal when returned from startup, otherwise confined to one
    /// connection.
    Transport(String),

    /// TLS handshake failed or timed out.
    ///
    /// Fatal for that connection only.
    Handshake(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake error: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
