//! Inbound classification.
//!
//! FCM wraps every JSON message in `<message><gcm xmlns="google:mobile:data">`.
//! The JSON header is decoded on its own first, and its `message_type`
//! decides which concrete shape the rest of the payload is parsed into.

use crate::stanza::{parse_stanza, Element};
use crate::{disambiguate, DecodeError, TextMessage};
use serde::Deserialize;

/// Namespace of the element carrying FCM's JSON payload.
pub const GCM_NAMESPACE: &str = "google:mobile:data";

/// An upstream message sent by the phone app.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamText {
    /// Registration token of the sending device.
    pub from: String,
    #[serde(default)]
    pub time_to_live: u64,
    pub message_id: String,
    #[serde(default)]
    pub category: String,
    /// Still-undecoded SMS/MMS record.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl UpstreamText {
    /// Decode `data` into an SMS or MMS record.
    pub fn text(&self) -> Result<TextMessage, DecodeError> {
        disambiguate(&self.data)
    }
}

/// FCM accepted a downstream message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryAck {
    #[serde(default)]
    pub from: String,
    pub message_id: String,
}

/// FCM rejected a downstream message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryNack {
    #[serde(default)]
    pub from: String,
    pub message_id: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
}

/// A classified inbound message. Exactly one per decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Text(UpstreamText),
    Ack(DeliveryAck),
    Nack(DeliveryNack),
    /// CONNECTION_DRAINING, the only control type FCM defines.
    DrainControl,
    Unrecognized { raw_type: String },
}

/// Result of classifying one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: InboundMessage,
    /// Set when the payload was understood only partially and the problem
    /// must still be reported (an unknown `message_type`).
    pub warning: Option<DecodeError>,
}

impl From<InboundMessage> for Decoded {
    fn from(message: InboundMessage) -> Self {
        Self {
            message,
            warning: None,
        }
    }
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    #[serde(default)]
    message_type: Option<String>,
}

/// Classify the JSON payload of a `gcm` element.
pub fn classify(payload: &str) -> Result<Decoded, DecodeError> {
    let header: EnvelopeHeader = serde_json::from_str(payload).map_err(malformed)?;

    let message = match header.message_type.as_deref() {
        None | Some("") => InboundMessage::Text(parse(payload)?),
        Some("ack") => InboundMessage::Ack(parse(payload)?),
        Some("nack") => InboundMessage::Nack(parse(payload)?),
        // control_type is not inspected: CONNECTION_DRAINING is the only one.
        Some("control") => InboundMessage::DrainControl,
        Some(other) => {
            return Ok(Decoded {
                message: InboundMessage::Unrecognized {
                    raw_type: other.to_string(),
                },
                warning: Some(DecodeError::UnknownMessageType(other.to_string())),
            });
        }
    };
    Ok(message.into())
}

/// Classify a whole stanza.
///
/// Returns `Ok(None)` for stanzas that are not FCM messages at all
/// (presence, iq, messages without a `gcm` payload).
pub fn classify_frame(frame: &[u8]) -> Result<Option<Decoded>, DecodeError> {
    let stanza = parse_stanza(frame)?;
    match gcm_payload(&stanza) {
        Some(payload) => classify(payload).map(Some),
        None => Ok(None),
    }
}

fn gcm_payload(stanza: &Element) -> Option<&str> {
    if stanza.local_name() != "message" {
        return None;
    }
    stanza
        .children_named("gcm")
        .find(|gcm| gcm.attr("xmlns").is_none_or(|ns| ns == GCM_NAMESPACE))
        .map(|gcm| gcm.text.as_str())
}

fn parse<'a, T: Deserialize<'a>>(payload: &'a str) -> Result<T, DecodeError> {
    serde_json::from_str(payload).map_err(malformed)
}

fn malformed(err: serde_json::Error) -> DecodeError {
    DecodeError::MalformedPayload(err.to_string())
}
