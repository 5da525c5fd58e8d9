//! Connection identity.
//!
//! Every connection gets a random UUID at creation. Ids are never reused, so
//! a late signal for a connection that has already been cleaned up can
//! never be mistaken for one about a newer connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque, unique identifier of one transport session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Allocate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = ConnectionIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ConnectionIdParseError::Empty);
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ConnectionIdParseError::Invalid(s.to_string()))
    }
}

impl TryFrom<String> for ConnectionId {
    type Error = ConnectionIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConnectionId> for String {
    fn from(id: ConnectionId) -> Self {
        id.to_string()
    }
}

/// Error parsing a connection id string.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionIdParseError {
    #[error("connection id cannot be empty")]
    Empty,
    #[error("connection id must be a UUID, got: {0}")]
    Invalid(String),
}
