//! Error taxonomy for the connection layer.

use smsrelay_core::{DecodeError, EncodeError};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// A failure reading or writing frames on an established transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[source] Arc<io::Error>),
    #[error("framing error: {0}")]
    Framing(String),
    #[error("transport is closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// A failure establishing a session.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("connect failed: {0}")]
    Io(#[source] Arc<io::Error>),
    #[error("invalid server name {0}")]
    ServerName(String),
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("server does not offer {0}")]
    Unsupported(&'static str),
    #[error("unexpected {0} during handshake")]
    Unexpected(String),
    #[error("stream closed during handshake")]
    StreamClosed,
    #[error("handshake refused: {0}")]
    Refused(String),
}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<TransportError> for HandshakeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(io) => Self::Io(io),
            TransportError::Framing(reason) => Self::Unexpected(reason),
            TransportError::Closed => Self::StreamClosed,
            TransportError::Encode(err) => Self::Unexpected(err.to_string()),
        }
    }
}

/// What went wrong on a connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientErrorKind {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("failed to ack upstream message {message_id}: {source}")]
    Ack {
        message_id: String,
        source: TransportError,
    },
    #[error("failed to send message {message_id}: {source}")]
    Send {
        message_id: String,
        source: TransportError,
    },
    #[error("FCM rejected message {message_id} to {from}: {code} - {description}")]
    Nack {
        from: String,
        message_id: String,
        code: String,
        description: String,
    },
    #[error("inbound sink closed, dropped upstream message {message_id}")]
    InboundClosed { message_id: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// An error raised by one connection, tagged with whether the connection
/// can keep going.
#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ClientErrorKind,
    fatal: bool,
}

impl ClientError {
    /// The connection cannot start or continue.
    pub fn fatal(kind: impl Into<ClientErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            fatal: true,
        }
    }

    /// Local to one operation; the connection keeps running.
    pub fn recoverable(kind: impl Into<ClientErrorKind>) -> Self {
        Self {
            kind: kind.into(),
            fatal: false,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn kind(&self) -> &ClientErrorKind {
        &self.kind
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Invalid or incomplete configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

/// The supervisor could not carry out a request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("supervisor is no longer running")]
    Stopped,
}
