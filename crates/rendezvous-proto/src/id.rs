//! Peer and room identifiers.
//!
//! Both are client-chosen opaque tokens: non-empty and free of whitespace, so
//! they can be embedded in space-separated frames. Room ids must additionally
//! differ from [`SESSION_MARKER`].

use std::{borrow::Borrow, fmt, str::FromStr};

use thiserror::Error;

/// Room id that clients of the text protocol cannot use.
///
/// Peer status used to be a string that was either empty, this literal, or a
/// room id. Status is a tagged value now, but the literal stays reserved on
/// the wire so existing clients see the same rejections.
pub const SESSION_MARKER: &str = "session";

/// Identifier validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Identifier is the empty string
    #[error("identifier is empty")]
    Empty,

    /// Identifier contains whitespace
    #[error("identifier contains whitespace: {0:?}")]
    Whitespace(String),

    /// Identifier is reserved by the protocol
    #[error("identifier is reserved: {0}")]
    Reserved(String),
}

fn validate_token(raw: &str) -> Result<(), IdError> {
    if raw.is_empty() {
        return Err(IdError::Empty);
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(IdError::Whitespace(raw.to_string()));
    }
    Ok(())
}

/// Identifier a peer registers with during the handshake.
///
/// Unique among currently registered peers; the registry enforces that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Validate and wrap a peer identifier.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        validate_token(raw)?;
        Ok(Self(raw.to_string()))
    }

    /// The identifier as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Name of a room. Rooms are created on first join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        validate_token(raw)?;
        if raw == SESSION_MARKER {
            return Err(IdError::Reserved(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The identifier as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! impl_token_traits {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $ty {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        // Lets maps keyed by the id be queried with the raw token from a frame.
        impl Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_token_traits!(PeerId);
impl_token_traits!(RoomId);
