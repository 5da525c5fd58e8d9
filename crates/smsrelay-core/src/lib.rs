//! Core types for relaying SMS/MMS through FCM's XMPP endpoint.
//!
//! This crate is I/O free. It owns the wire contract (stanza parsing,
//! inbound classification, outbound envelopes) and the small vocabulary the
//! connection layer speaks in (connection ids, states, signals).

mod codec;
mod error;
mod id;
mod outbound;
mod signal;
pub mod stanza;
mod text;

pub use codec::{
    classify, classify_frame, Decoded, DeliveryAck, DeliveryNack, InboundMessage, UpstreamText,
    GCM_NAMESPACE,
};
pub use error::{DecodeError, EncodeError};
pub use id::{ConnectionId, ConnectionIdParseError};
pub use outbound::{
    encode_ack, encode_downstream, AckEnvelope, DownstreamPayload, Notification,
    OutboundMessage, Priority,
};
pub use signal::Signal;
pub use text::{disambiguate, MmsMessage, SmsMessage, TextMessage};

/// Connection lifecycle state.
///
/// States only ever move forward, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting = 0,
    /// Handshake complete, normal operation.
    Active = 1,
    /// The server asked us to open a replacement; still receiving.
    Draining = 2,
    /// The transport reported end-of-stream.
    Closed = 3,
}

impl ConnectionState {
    /// Decode from the `repr(u8)` value, saturating unknown values to `Closed`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }

    /// Whether the connection may still carry outbound traffic.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Draining)
    }
}
