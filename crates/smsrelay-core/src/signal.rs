//! Lifecycle signals for connection hand-off.

use crate::ConnectionId;

/// A lifecycle notice from a connection to its supervisor.
///
/// Signals carry only the id. The supervisor resolves everything else from
/// its own registry, so a signal for an id it no longer knows is harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The server sent CONNECTION_DRAINING: open a replacement.
    Drain { connection: ConnectionId },
    /// The transport reached end-of-stream.
    Closed { connection: ConnectionId },
}

impl Signal {
    /// The connection this signal is about.
    pub fn connection(&self) -> ConnectionId {
        match self {
            Self::Drain { connection } | Self::Closed { connection } => *connection,
        }
    }
}
