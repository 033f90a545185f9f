use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::detect::Platform;

/// Literal prefix marking chat identifiers that belong to the Max platform.
/// Identifiers without the prefix are numeric Telegram or CRM line chat ids.
pub const MAX_PREFIX: &str = "max_";

/// Prefix a native Max chat id so it can travel through the CRM side
/// without colliding with numeric Telegram ids.
pub fn add_max_prefix(native: &str) -> String {
    format!("{MAX_PREFIX}{native}")
}

/// Strip the Max prefix, returning the native id, or `None` when the
/// identifier belongs to another namespace. `strip(add(x)) == x` for all `x`.
pub fn strip_max_prefix(chat_id: &str) -> Option<&str> {
    chat_id.strip_prefix(MAX_PREFIX)
}

pub fn is_max_chat_id(chat_id: &str) -> bool {
    chat_id.starts_with(MAX_PREFIX)
}

/// Prefix a Max chat id unless it already carries the namespace marker.
/// Used when extracting ids from payloads that may have round-tripped
/// through the CRM and come back already prefixed.
pub fn ensure_max_prefix(chat_id: &str) -> String {
    if is_max_chat_id(chat_id) {
        chat_id.to_string()
    } else {
        add_max_prefix(chat_id)
    }
}

/// Content kind of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Photo,
    Document,
    Voice,
    Video,
    Audio,
    Sticker,
    Location,
    Contact,
    File,
    Image,
    Unknown,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Sticker => "sticker",
            Self::Location => "location",
            Self::Contact => "contact",
            Self::File => "file",
            Self::Image => "image",
            Self::Unknown => "unknown",
        }
    }
}

/// Normalized, transient representation of one inbound message.
/// Constructed per request, never persisted.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: Platform,
    pub message_type: MessageType,
    /// Namespaced cross-platform address of the conversation. Always carries
    /// enough information to reconstruct the native id and origin platform.
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    /// Message text in canonical bracket markup.
    pub text: String,
    pub is_reply: bool,
    pub timestamp: DateTime<Utc>,
}
