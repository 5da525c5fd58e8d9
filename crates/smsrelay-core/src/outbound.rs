//! Outbound envelopes.
//!
//! Everything sent to FCM is a JSON document inside
//! `<message><gcm xmlns="google:mobile:data">…</gcm></message>`.

use crate::{EncodeError, TextMessage, GCM_NAMESPACE};
use quick_xml::escape::{escape, partial_escape};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Acknowledgement of an upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEnvelope {
    /// Registration token of the device that sent the upstream message.
    pub to: String,
    pub message_id: String,
}

#[derive(Serialize)]
struct AckBody<'a> {
    to: &'a str,
    message_id: &'a str,
    message_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// Display notification shown by the device on delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// A message relayed from the application server to a device.
///
/// Optional fields are left out of the JSON when unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Seconds FCM keeps the message if the device is offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u32>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delivery_receipt_requested: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub dry_run: bool,
    pub data: TextMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
}

impl DownstreamPayload {
    /// A high-priority message with a fresh id and a one hour TTL.
    pub fn text(to: impl Into<String>, data: impl Into<TextMessage>) -> Self {
        Self {
            to: to.into(),
            condition: None,
            message_id: Uuid::new_v4().to_string(),
            collapse_key: None,
            priority: Some(Priority::High),
            time_to_live: Some(3600),
            delivery_receipt_requested: false,
            dry_run: false,
            data: data.into(),
            notification: None,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Anything the connection layer can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Ack(AckEnvelope),
    Downstream(DownstreamPayload),
}

impl OutboundMessage {
    /// The id shared between this message and its acknowledgement.
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Ack(ack) => &ack.message_id,
            Self::Downstream(payload) => &payload.message_id,
        }
    }

    /// Registration token (or topic) the message is addressed to.
    pub fn target(&self) -> &str {
        match self {
            Self::Ack(ack) => &ack.to,
            Self::Downstream(payload) => &payload.to,
        }
    }

    /// Render the complete stanza.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        match self {
            Self::Ack(ack) => encode_ack(&ack.to, &ack.message_id),
            Self::Downstream(payload) => encode_downstream(payload),
        }
    }
}

impl From<AckEnvelope> for OutboundMessage {
    fn from(ack: AckEnvelope) -> Self {
        Self::Ack(ack)
    }
}

impl From<DownstreamPayload> for OutboundMessage {
    fn from(payload: DownstreamPayload) -> Self {
        Self::Downstream(payload)
    }
}

/// Build the stanza acknowledging upstream message `message_id` from `to`.
pub fn encode_ack(to: &str, message_id: &str) -> Result<Vec<u8>, EncodeError> {
    let body = serde_json::to_string(&AckBody {
        to,
        message_id,
        message_type: "ack",
    })?;
    Ok(wrap(None, &body))
}

/// Build the stanza for a downstream message.
pub fn encode_downstream(payload: &DownstreamPayload) -> Result<Vec<u8>, EncodeError> {
    let body = serde_json::to_string(payload)?;
    Ok(wrap(Some(&payload.message_id), &body))
}

/// Put `json` inside the GCM envelope. The stanza `id` is left out when
/// there is none or it is empty.
fn wrap(id: Option<&str>, json: &str) -> Vec<u8> {
    let mut out = String::with_capacity(json.len() + 80);
    out.push_str("<message");
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        out.push_str(" id=\"");
        out.push_str(&escape(id));
        out.push('"');
    }
    out.push_str("><gcm xmlns=\"");
    out.push_str(GCM_NAMESPACE);
    out.push_str("\">");
    out.push_str(&partial_escape(json));
    out.push_str("</gcm></message>");
    out.into_bytes()
}
