/// Failure to turn received bytes into a typed message.
///
/// Decode errors are always local to one frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed stanza: {0}")]
    MalformedStanza(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("malformed text message data: {0}")]
    MalformedText(String),
}

/// Failure to render an outbound message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot encode outbound message: {0}")]
pub struct EncodeError(pub String);

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}
