//! The seam between connections and the bytes underneath them.

use crate::{HandshakeError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use smsrelay_core::ConnectionId;

/// Opens authenticated sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Source: FrameSource;
    type Sink: FrameSink;

    /// Connect and complete the whole handshake. On success the returned
    /// halves carry application stanzas only.
    async fn connect(&self, id: ConnectionId) -> Result<(Self::Source, Self::Sink), HandshakeError>;
}

/// The receiving half of a session.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next complete stanza, or `Ok(None)` once the stream has ended.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// The sending half of a session.
#[async_trait]
pub trait FrameSink: Send + 'static {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;
}
