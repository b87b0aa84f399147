//! Application messages carried in publish payloads.
//!
//! Messages travel as compact JSON objects:
//!
//! ```json
//! {"uid":"m1","type":"TEXT","status":"SENT","content":{"text":"hi"},
//!  "createdAt":"2024-05-01T08:00:00.000Z","threadUid":"conv1",
//!  "userUid":"u1","userName":"Ada","userAvatar":""}
//! ```
//!
//! Decoding is lenient: unknown `type` values read as [`MessageKind::Text`],
//! unknown `status` values as [`MessageStatus::Sending`], and a bare string
//! `content` becomes the message text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
    Video,
    Voice,
    /// Peer is typing. Never stored.
    Typing,
    /// System notice shown inline.
    Notice,
    /// Retracts an earlier message.
    Recall,
    /// Receipt: referenced message reached the peer.
    Delivered,
    /// Receipt: referenced message was read.
    Read,
    Custom,
}

impl MessageKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Image => "IMAGE",
            MessageKind::File => "FILE",
            MessageKind::Video => "VIDEO",
            MessageKind::Voice => "VOICE",
            MessageKind::Typing => "TYPING",
            MessageKind::Notice => "NOTICE",
            MessageKind::Recall => "RECALL",
            MessageKind::Delivered => "DELIVERED",
            MessageKind::Read => "READ",
            MessageKind::Custom => "CUSTOM",
        }
    }

    /// Parse a wire name, falling back to `Text`.
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        match name {
            "IMAGE" => MessageKind::Image,
            "FILE" => MessageKind::File,
            "VIDEO" => MessageKind::Video,
            "VOICE" => MessageKind::Voice,
            "TYPING" => MessageKind::Typing,
            "NOTICE" => MessageKind::Notice,
            "RECALL" => MessageKind::Recall,
            "DELIVERED" => MessageKind::Delivered,
            "READ" => MessageKind::Read,
            "CUSTOM" => MessageKind::Custom,
            _ => MessageKind::Text,
        }
    }

    /// Whether this kind is a delivered/read receipt.
    #[must_use]
    pub fn is_receipt(self) -> bool {
        matches!(self, MessageKind::Delivered | MessageKind::Read)
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MessageStatus {
    #[default]
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
    Recalled,
}

impl MessageStatus {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "SENDING",
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Read => "READ",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Recalled => "RECALLED",
        }
    }

    /// Parse a wire name, falling back to `Sending`.
    #[must_use]
    pub fn from_wire(name: &str) -> Self {
        match name {
            "SENT" => MessageStatus::Sent,
            "DELIVERED" => MessageStatus::Delivered,
            "READ" => MessageStatus::Read,
            "FAILED" => MessageStatus::Failed,
            "RECALLED" => MessageStatus::Recalled,
            _ => MessageStatus::Sending,
        }
    }
}

macro_rules! wire_name_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = Option::<String>::deserialize(deserializer)?;
                Ok(name.map_or_else(Self::default, |n| Self::from_wire(&n)))
            }
        }
    };
}

wire_name_serde!(MessageKind);
wire_name_serde!(MessageStatus);

/// Message body. Empty and zero fields are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageContent {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub image_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub file_size: u64,
    /// Audio/video length in seconds.
    #[serde(skip_serializing_if = "is_zero")]
    pub duration: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub width: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub height: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

impl MessageContent {
    /// Text-only content.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Image content.
    #[must_use]
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            image_url: url.into(),
            ..Self::default()
        }
    }

    /// File attachment content.
    #[must_use]
    pub fn file(url: impl Into<String>, name: impl Into<String>, size: u64) -> Self {
        Self {
            file_url: url.into(),
            file_name: name.into(),
            file_size: size,
            ..Self::default()
        }
    }
}

/// Accepts an object, a JSON-encoded object string, or plain text.
fn deserialize_content<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MessageContent, D::Error> {
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(text)) => {
            match serde_json::from_str::<serde_json::Value>(&text) {
                Ok(value @ serde_json::Value::Object(_)) => {
                    serde_json::from_value(value).map_err(serde::de::Error::custom)
                }
                _ => Ok(MessageContent::text(text)),
            }
        }
        Some(value @ serde_json::Value::Object(_)) => {
            serde_json::from_value(value).map_err(serde::de::Error::custom)
        }
        _ => Ok(MessageContent::default()),
    }
}

mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// RFC 3339, or a zone-less ISO timestamp read as UTC. Anything else
    /// reads as now.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(parsed.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(naive.and_utc());
        }
        Ok(Utc::now())
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMessage {
    /// Unique id. Empty means a null message.
    #[serde(default)]
    pub uid: String,

    #[serde(rename = "type", default)]
    pub kind: MessageKind,

    #[serde(default)]
    pub status: MessageStatus,

    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: MessageContent,

    #[serde(default = "Utc::now", with = "timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(rename = "threadUid", default)]
    pub conversation_id: String,

    #[serde(rename = "userUid", default)]
    pub sender_id: String,

    #[serde(rename = "userName", default)]
    pub sender_display_name: String,

    #[serde(rename = "userAvatar", default)]
    pub sender_avatar: String,

    /// Free-form JSON attached by the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Who outbound messages are attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub uid: String,
    pub display_name: String,
    pub avatar: String,
}

impl Sender {
    #[must_use]
    pub fn new(uid: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: display_name.into(),
            avatar: String::new(),
        }
    }
}

impl ApplicationMessage {
    /// Compose a new outbound message with a fresh uid in `Sending` state.
    #[must_use]
    pub fn compose(
        kind: MessageKind,
        conversation_id: impl Into<String>,
        content: MessageContent,
        sender: &Sender,
    ) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            kind,
            status: MessageStatus::Sending,
            content,
            created_at: Utc::now(),
            conversation_id: conversation_id.into(),
            sender_id: sender.uid.clone(),
            sender_display_name: sender.display_name.clone(),
            sender_avatar: sender.avatar.clone(),
            extra: None,
        }
    }

    /// Whether this is a null message (no uid).
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.uid.is_empty()
    }

    /// Uid of the message a receipt refers to.
    #[must_use]
    pub fn referenced_uid(&self) -> Option<&str> {
        if self.kind.is_receipt() && !self.content.text.is_empty() {
            Some(&self.content.text)
        } else {
            None
        }
    }

    /// Serialize to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if `extra` holds a value JSON cannot represent.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a publish payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not a JSON object of the expected shape.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
