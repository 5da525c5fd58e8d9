//! One supervised session with FCM.
//!
//! A [`Connection`] is split in two once it is open: the receive loop owns
//! the [`FrameSource`], and any number of [`ConnectionLink`] clones share
//! the [`FrameSink`] for writing. The receive loop writes acks through the
//! same link the send loop uses.

use crate::transport::{Connector, FrameSink, FrameSource};
use crate::{ClientError, ClientErrorKind, ErrorSink, TransportError};
use bytes::Bytes;
use smsrelay_core::{
    classify_frame, encode_ack, ConnectionId, ConnectionState, InboundMessage, OutboundMessage,
    Signal, TextMessage, UpstreamText,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Where decoded SMS/MMS records go. Shared by all connections.
pub type InboundSink = mpsc::Sender<TextMessage>;

/// Where connections announce drain and close.
pub type SignalSink = mpsc::UnboundedSender<Signal>;

/// Shared, forward-only connection state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Connecting as u8)))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` unless already past it. Returns the previous state.
    pub(crate) fn advance(&self, next: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.fetch_max(next as u8, Ordering::AcqRel))
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Write access to an open connection.
pub struct ConnectionLink<S> {
    id: ConnectionId,
    state: StateCell,
    sink: Arc<Mutex<S>>,
    errors: ErrorSink,
}

impl<S> Clone for ConnectionLink<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: self.state.clone(),
            sink: self.sink.clone(),
            errors: self.errors.clone(),
        }
    }
}

impl<S: FrameSink> ConnectionLink<S> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Encode and write one message.
    ///
    /// Sends are driven from a queue, so a failed write is reported to the
    /// error sink as recoverable instead of being returned.
    pub async fn send(&self, message: &OutboundMessage) {
        let written = match message.encode() {
            Ok(frame) => self.write(Bytes::from(frame)).await,
            Err(err) => Err(err.into()),
        };
        if let Err(source) = written {
            self.errors.report(
                self.id,
                ClientError::recoverable(ClientErrorKind::Send {
                    message_id: message.correlation_id().to_string(),
                    source,
                }),
            );
        } else {
            tracing::trace!(
                connection = %self.id,
                message_id = message.correlation_id(),
                "sent"
            );
        }
    }

    async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        self.sink.lock().await.send(frame).await
    }
}

/// An open session whose receive loop has not started yet.
pub struct Connection<C: Connector> {
    link: ConnectionLink<C::Sink>,
    source: C::Source,
    signals: SignalSink,
}

impl<C: Connector> Connection<C> {
    /// Connect and handshake.
    ///
    /// A handshake failure is reported to `errors` as fatal and returned;
    /// no half-open connection is ever handed out.
    pub async fn open(
        connector: &C,
        id: ConnectionId,
        signals: SignalSink,
        errors: ErrorSink,
    ) -> Result<Self, ClientError> {
        let state = StateCell::new();
        tracing::debug!(connection = %id, "opening connection");

        let (source, sink) = match connector.connect(id).await {
            Ok(halves) => halves,
            Err(err) => {
                let err = ClientError::fatal(err);
                errors.report(id, err.clone());
                return Err(err);
            }
        };

        state.advance(ConnectionState::Active);
        tracing::info!(connection = %id, "connection active");
        Ok(Self {
            link: ConnectionLink {
                id,
                state,
                sink: Arc::new(Mutex::new(sink)),
                errors,
            },
            source,
            signals,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.link.id
    }

    pub fn link(&self) -> ConnectionLink<C::Sink> {
        self.link.clone()
    }

    /// Process frames in arrival order until the stream ends.
    ///
    /// Only end-of-stream stops the loop. Read errors are reported and the
    /// loop keeps reading; a drain notice does not stop it either.
    pub async fn receive(self, inbound: InboundSink) {
        let Self {
            link,
            mut source,
            signals,
        } = self;
        let id = link.id;
        loop {
            match source.recv().await {
                Ok(Some(frame)) => link.handle_frame(&frame, &signals, &inbound).await,
                Ok(None) => break,
                Err(err) => {
                    link.errors.report(id, ClientError::recoverable(err));
                }
            }
        }

        link.state.advance(ConnectionState::Closed);
        tracing::info!(connection = %id, "connection closed");
        if signals.send(Signal::Closed { connection: id }).is_err() {
            tracing::debug!(connection = %id, "supervisor gone, close signal dropped");
        }
    }
}

impl<S: FrameSink> ConnectionLink<S> {
    async fn handle_frame(&self, frame: &[u8], signals: &SignalSink, inbound: &InboundSink) {
        let id = self.id;
        let decoded = match classify_frame(frame) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => {
                tracing::trace!(connection = %id, "ignoring non-FCM stanza");
                return;
            }
            Err(err) => {
                self.errors.report(id, ClientError::recoverable(err));
                return;
            }
        };
        if let Some(warning) = decoded.warning {
            self.errors.report(id, ClientError::recoverable(warning));
        }

        match decoded.message {
            InboundMessage::Text(upstream) => self.accept_text(upstream, inbound).await,
            InboundMessage::Ack(ack) => {
                tracing::debug!(connection = %id, message_id = %ack.message_id, "downstream message acked");
            }
            InboundMessage::Nack(nack) => {
                self.errors.report(
                    id,
                    ClientError::recoverable(ClientErrorKind::Nack {
                        from: nack.from,
                        message_id: nack.message_id,
                        code: nack.error,
                        description: nack.error_description,
                    }),
                );
            }
            InboundMessage::DrainControl => {
                self.state.advance(ConnectionState::Draining);
                tracing::info!(connection = %id, "server requested drain");
                if signals.send(Signal::Drain { connection: id }).is_err() {
                    tracing::debug!(connection = %id, "supervisor gone, drain signal dropped");
                }
            }
            InboundMessage::Unrecognized { raw_type } => {
                tracing::debug!(connection = %id, message_type = %raw_type, "skipping unrecognized message");
            }
        }
    }

    /// Ack first, then forward. The ack goes out whatever happens to the
    /// payload afterwards.
    async fn accept_text(&self, upstream: UpstreamText, inbound: &InboundSink) {
        let id = self.id;
        let written = match encode_ack(&upstream.from, &upstream.message_id) {
            Ok(ack) => self.write(Bytes::from(ack)).await,
            Err(err) => Err(err.into()),
        };
        if let Err(source) = written {
            self.errors.report(
                id,
                ClientError::recoverable(ClientErrorKind::Ack {
                    message_id: upstream.message_id.clone(),
                    source,
                }),
            );
        }

        let text = match upstream.text() {
            Ok(text) => text,
            Err(err) => {
                self.errors.report(id, ClientError::recoverable(err));
                return;
            }
        };
        tracing::debug!(
            connection = %id,
            message_id = %upstream.message_id,
            mms = text.is_mms(),
            "upstream message received"
        );
        if inbound.send(text).await.is_err() {
            self.errors.report(
                id,
                ClientError::recoverable(ClientErrorKind::InboundClosed {
                    message_id: upstream.message_id,
                }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryConnector, MemoryPeer};
    use crate::{ErrorReport, HandshakeError};
    use smsrelay_core::{AckEnvelope, SmsMessage};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn state_never_moves_backward() {
        let cell = StateCell::new();
        assert_eq!(cell.advance(ConnectionState::Active), ConnectionState::Connecting);
        assert_eq!(cell.advance(ConnectionState::Closed), ConnectionState::Active);

        assert_eq!(cell.advance(ConnectionState::Draining), ConnectionState::Closed);
        assert_eq!(cell.advance(ConnectionState::Active), ConnectionState::Closed);
        assert_eq!(cell.get(), ConnectionState::Closed);
        // Clones observe the same cell.
        assert_eq!(cell.clone().get(), ConnectionState::Closed);
    }

    struct Harness {
        peer: MemoryPeer,
        link: ConnectionLink<crate::memory::MemorySink>,
        signals: mpsc::UnboundedReceiver<Signal>,
        reports: mpsc::UnboundedReceiver<ErrorReport>,
        inbound: mpsc::Receiver<TextMessage>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn harness() -> Harness {
        let (connector, mut peers) = MemoryConnector::new();
        let (signals_tx, signals) = mpsc::unbounded_channel();
        let (errors, reports) = ErrorSink::channel();
        let (inbound_tx, inbound) = mpsc::channel(8);

        let connection = Connection::open(&connector, ConnectionId::generate(), signals_tx, errors)
            .await
            .unwrap();
        let link = connection.link();
        let task = tokio::spawn(connection.receive(inbound_tx));
        let peer = peers.recv().await.unwrap();
        Harness {
            peer,
            link,
            signals,
            reports,
            inbound,
            task,
        }
    }

    fn gcm(json: &str) -> Bytes {
        Bytes::from(format!(
            r#"<message id=""><gcm xmlns="google:mobile:data">{json}</gcm></message>"#
        ))
    }

    const UPSTREAM_SMS: &str = r#"{"from":"device-1","time_to_live":0,"message_id":"m-1","category":"app","data":{"phone_number":"+15555550123","message":"hi","timestamp":"1000"}}"#;

    async fn next_report(h: &mut Harness) -> ErrorReport {
        timeout(WAIT, h.reports.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn text_is_acked_then_forwarded() {
        let mut h = harness().await;
        assert_eq!(h.link.state(), ConnectionState::Active);
        h.peer.push(gcm(UPSTREAM_SMS));

        let text = timeout(WAIT, h.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(
            text,
            TextMessage::Sms(SmsMessage {
                phone_number: "+15555550123".into(),
                message: "hi".into(),
                timestamp: 1000,
            })
        );
        // The ack was written before the payload was forwarded.
        let ack = h.peer.try_next_sent().expect("ack sent before forwarding");
        assert_eq!(
            ack,
            Bytes::from(OutboundMessage::from(AckEnvelope {
                to: "device-1".into(),
                message_id: "m-1".into(),
            })
            .encode()
            .unwrap())
        );
        assert!(h.peer.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn ack_is_sent_even_if_forwarding_fails() {
        let mut h = harness().await;
        h.inbound.close();
        h.peer.push(gcm(UPSTREAM_SMS));

        let ack = timeout(WAIT, h.peer.next_sent()).await.unwrap().unwrap();
        assert!(ack.windows(4).any(|w| w == b"m-1\""));
        let report = next_report(&mut h).await;
        assert!(!report.error.is_fatal());
        assert!(matches!(
            report.error.kind(),
            ClientErrorKind::InboundClosed { message_id } if message_id == "m-1"
        ));
    }

    #[tokio::test]
    async fn nack_is_reported_not_forwarded() {
        let mut h = harness().await;
        h.peer.push(gcm(
            r#"{"message_type":"nack","from":"X","message_id":"42","error":"BAD","error_description":"oops"}"#,
        ));

        let report = next_report(&mut h).await;
        assert!(!report.error.is_fatal());
        assert!(matches!(
            report.error.kind(),
            ClientErrorKind::Nack { code, description, .. } if code == "BAD" && description == "oops"
        ));
        assert!(h.inbound.try_recv().is_err());
        assert!(h.peer.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn drain_signals_and_keeps_receiving() {
        let mut h = harness().await;
        h.peer.push(gcm(r#"{"message_type":"control","control_type":"CONNECTION_DRAINING"}"#));

        let signal = timeout(WAIT, h.signals.recv()).await.unwrap().unwrap();
        assert_eq!(signal, Signal::Drain { connection: h.link.id() });
        assert_eq!(h.link.state(), ConnectionState::Draining);

        h.peer.push(gcm(UPSTREAM_SMS));
        let text = timeout(WAIT, h.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(text.body(), "hi");
        assert!(!h.task.is_finished());
    }

    #[tokio::test]
    async fn end_of_stream_closes() {
        let mut h = harness().await;
        h.peer.close();

        let signal = timeout(WAIT, h.signals.recv()).await.unwrap().unwrap();
        assert_eq!(signal, Signal::Closed { connection: h.link.id() });
        timeout(WAIT, h.task).await.unwrap().unwrap();
        assert_eq!(h.link.state(), ConnectionState::Closed);
        assert!(h.reports.try_recv().is_err(), "end-of-stream is not an error");
    }

    #[tokio::test]
    async fn transport_errors_do_not_stop_the_loop() {
        let mut h = harness().await;
        h.peer.push_error(TransportError::Framing("garbage".into()));
        let report = next_report(&mut h).await;
        assert!(!report.error.is_fatal());

        h.peer.push(gcm(UPSTREAM_SMS));
        assert!(timeout(WAIT, h.inbound.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn presence_is_ignored_silently() {
        let mut h = harness().await;
        h.peer.push(&b"<presence/>"[..]);
        h.peer.push(gcm(UPSTREAM_SMS));
        assert!(timeout(WAIT, h.inbound.recv()).await.unwrap().is_some());
        assert!(h.reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn decode_problems_are_reported() {
        let mut h = harness().await;
        h.peer.push(&b"<message><gcm>"[..]);
        let report = next_report(&mut h).await;
        assert!(matches!(report.error.kind(), ClientErrorKind::Decode(_)));

        h.peer.push(gcm(r#"{"message_type":"receipt"}"#));
        let report = next_report(&mut h).await;
        assert!(matches!(
            report.error.kind(),
            ClientErrorKind::Decode(smsrelay_core::DecodeError::UnknownMessageType(t)) if t == "receipt"
        ));
        assert!(!report.error.is_fatal());
    }

    #[tokio::test]
    async fn delivery_ack_needs_no_action() {
        let mut h = harness().await;
        h.peer.push(gcm(r#"{"message_type":"ack","from":"d","message_id":"1"}"#));
        h.peer.push(gcm(UPSTREAM_SMS));
        assert!(timeout(WAIT, h.inbound.recv()).await.unwrap().is_some());
        assert!(h.reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_send_is_reported() {
        let mut h = harness().await;
        let message: OutboundMessage = AckEnvelope {
            to: "d".into(),
            message_id: "out-1".into(),
        }
        .into();
        h.link.send(&message).await;
        assert!(timeout(WAIT, h.peer.next_sent()).await.unwrap().is_some());

        let Harness {
            peer,
            link,
            mut reports,
            ..
        } = h;
        drop(peer);
        link.send(&message).await;
        let report = timeout(WAIT, reports.recv()).await.unwrap().unwrap();
        assert!(matches!(
            report.error.kind(),
            ClientErrorKind::Send { message_id, source: TransportError::Closed } if message_id == "out-1"
        ));
    }

    #[tokio::test]
    async fn handshake_failure_is_fatal() {
        let (connector, _peers) = MemoryConnector::new();
        connector.fail_next(1);
        let (signals, _signals_rx) = mpsc::unbounded_channel();
        let (errors, mut reports) = ErrorSink::channel();
        let id = ConnectionId::generate();

        let err = Connection::open(&connector, id, signals, errors)
            .await
            .err()
            .expect("handshake must fail");
        assert!(err.is_fatal());
        assert!(matches!(
            err.kind(),
            ClientErrorKind::Handshake(HandshakeError::Refused(_))
        ));
        let report = reports.try_recv().unwrap();
        assert_eq!(report.connection, id);
        assert!(report.error.is_fatal());
    }
}
