//! SMS and MMS records carried in the `data` field of FCM messages.
//!
//! FCM only allows string values inside `data`, so the phone app sends the
//! timestamp as a decimal string and the recipient list as a JSON-encoded
//! string. Both forms, and their native JSON equivalents, are accepted on
//! decode. Serialization always produces the string forms.

use crate::DecodeError;
use serde::{Deserialize, Deserializer, Serialize};

/// A plain text message: one counterpart, no attachments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(with = "lenient_i64")]
    pub timestamp: i64,
}

/// A multimedia or group message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmsMessage {
    pub phone_number: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(with = "lenient_i64")]
    pub timestamp: i64,
    #[serde(default, with = "encoded_list")]
    pub recipients: Vec<String>,
    /// Identifies the attachment parts uploaded alongside the message.
    #[serde(default, rename = "block_id", skip_serializing_if = "String::is_empty")]
    pub part_block_id: String,
}

impl MmsMessage {
    /// Whether this record actually needs MMS semantics.
    pub fn is_mms(&self) -> bool {
        self.recipients.len() > 1 || !self.part_block_id.is_empty()
    }
}

impl From<MmsMessage> for SmsMessage {
    fn from(mms: MmsMessage) -> Self {
        Self {
            phone_number: mms.phone_number,
            message: mms.message,
            timestamp: mms.timestamp,
        }
    }
}

/// A text message relayed between the phone and the application server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TextMessage {
    Mms(MmsMessage),
    Sms(SmsMessage),
}

impl<'de> Deserialize<'de> for TextMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        MmsMessage::deserialize(deserializer).map(Self::from_record)
    }
}

impl TextMessage {
    /// Classify a record parsed in its MMS shape.
    pub fn from_record(mms: MmsMessage) -> Self {
        if mms.is_mms() {
            Self::Mms(mms)
        } else {
            Self::Sms(mms.into())
        }
    }

    pub fn is_mms(&self) -> bool {
        matches!(self, Self::Mms(_))
    }

    pub fn phone_number(&self) -> &str {
        match self {
            Self::Sms(sms) => &sms.phone_number,
            Self::Mms(mms) => &mms.phone_number,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Sms(sms) => &sms.message,
            Self::Mms(mms) => &mms.message,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Self::Sms(sms) => sms.timestamp,
            Self::Mms(mms) => mms.timestamp,
        }
    }
}

impl From<SmsMessage> for TextMessage {
    fn from(sms: SmsMessage) -> Self {
        Self::Sms(sms)
    }
}

impl From<MmsMessage> for TextMessage {
    fn from(mms: MmsMessage) -> Self {
        Self::Mms(mms)
    }
}

/// Decide whether an upstream `data` object is an SMS or an MMS.
///
/// The record is always parsed in its MMS shape first. SMS is the degenerate
/// case: at most one recipient and no attached parts.
pub fn disambiguate(raw: &serde_json::Value) -> Result<TextMessage, DecodeError> {
    TextMessage::deserialize(raw).map_err(|e| DecodeError::MalformedText(e.to_string()))
}

mod lenient_i64 {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
        }
    }
}

mod encoded_list {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<String>),
        Encoded(String),
    }

    pub fn serialize<S: Serializer>(value: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = serde_json::to_string(value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::List(list) => Ok(list),
            Repr::Encoded(s) if s.trim().is_empty() => Ok(Vec::new()),
            Repr::Encoded(s) => serde_json::from_str(&s).map_err(serde::de::Error::custom),
        }
    }
}
