//! In-process transport.
//!
//! Every successful [`MemoryConnector::connect`] hands the remote end of the
//! new session to the receiver returned by [`MemoryConnector::new`]. The
//! remote end plays the FCM server: it injects frames, watches what the
//! connection writes, and ends the stream by closing or dropping.

use crate::transport::{Connector, FrameSink, FrameSource};
use crate::{HandshakeError, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use smsrelay_core::ConnectionId;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// Clones share the peer channel and the scripted failure count.
#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    failures: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                failures: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Make the next `count` handshakes fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.fetch_add(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Source = MemorySource;
    type Sink = MemorySink;

    async fn connect(&self, id: ConnectionId) -> Result<(MemorySource, MemorySink), HandshakeError> {
        let scripted_failure = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(HandshakeError::Refused("scripted failure".into()));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            connection: id,
            inbound: Some(inbound_tx),
            outbound: outbound_rx,
        };
        self.peers
            .send(peer)
            .map_err(|_| HandshakeError::Refused("no one is accepting sessions".into()))?;
        Ok((
            MemorySource { frames: inbound_rx },
            MemorySink {
                frames: outbound_tx,
            },
        ))
    }
}

pub struct MemorySource {
    frames: mpsc::UnboundedReceiver<Result<Bytes, TransportError>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        self.frames.recv().await.transpose()
    }
}

pub struct MemorySink {
    frames: mpsc::UnboundedSender<Bytes>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.frames.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// The server side of one in-memory session.
pub struct MemoryPeer {
    pub connection: ConnectionId,
    inbound: Option<mpsc::UnboundedSender<Result<Bytes, TransportError>>>,
    outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryPeer {
    /// Deliver a frame to the connection. Returns false once closed.
    pub fn push(&self, frame: impl Into<Bytes>) -> bool {
        self.deliver(Ok(frame.into()))
    }

    /// Make the connection's next read fail.
    pub fn push_error(&self, err: TransportError) -> bool {
        self.deliver(Err(err))
    }

    fn deliver(&self, item: Result<Bytes, TransportError>) -> bool {
        self.inbound
            .as_ref()
            .is_some_and(|inbound| inbound.send(item).is_ok())
    }

    /// End the stream. Frames already pushed are still delivered first.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Next frame the connection wrote.
    pub async fn next_sent(&mut self) -> Option<Bytes> {
        self.outbound.recv().await
    }

    pub fn try_next_sent(&mut self) -> Option<Bytes> {
        self.outbound.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (connector, mut peers) = MemoryConnector::new();
        let id = ConnectionId::generate();
        let (mut source, mut sink) = connector.connect(id).await.unwrap();
        let mut peer = peers.recv().await.unwrap();
        assert_eq!(peer.connection, id);

        assert!(peer.push(&b"<presence/>"[..]));
        assert_eq!(source.recv().await.unwrap().unwrap(), &b"<presence/>"[..]);

        sink.send(Bytes::from_static(b"<message/>")).await.unwrap();
        assert_eq!(peer.next_sent().await.unwrap(), &b"<message/>"[..]);

        peer.push_error(TransportError::Framing("bad".into()));
        assert!(source.recv().await.is_err());

        peer.close();
        assert!(!peer.push(&b"<late/>"[..]));
        assert_eq!(source.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed() {
        let (connector, _peers) = MemoryConnector::new();
        connector.fail_next(1);
        assert!(matches!(
            connector.connect(ConnectionId::generate()).await,
            Err(HandshakeError::Refused(_))
        ));
        assert!(connector.connect(ConnectionId::generate()).await.is_ok());
    }

    #[tokio::test]
    async fn dropped_peer_closes_both_directions() {
        let (connector, mut peers) = MemoryConnector::new();
        let (mut source, mut sink) = connector.connect(ConnectionId::generate()).await.unwrap();
        drop(peers.recv().await.unwrap());
        assert_eq!(source.recv().await.unwrap(), None);
        assert!(matches!(
            sink.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
    }
}
