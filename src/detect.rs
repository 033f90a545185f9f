use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::envelope::{ensure_max_prefix, MessageType};

/// CRM event name for an operator message posted into an open line.
pub const BITRIX_MESSAGE_EVENT: &str = "ONIMCONNECTORMESSAGEADD";
/// CRM event name fired when the application is removed from a tenant.
pub const BITRIX_UNINSTALL_EVENT: &str = "ONAPPUNINSTALL";
/// Placement identifier of the connector settings page.
pub const CONNECTOR_PLACEMENT: &str = "SETTING_CONNECTOR";

/// Originating platform of an inbound webhook payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Bitrix,
    Telegram,
    SessionRelay,
    Max,
    Unknown,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bitrix => "bitrix",
            Self::Telegram => "telegram",
            Self::SessionRelay => "session_relay",
            Self::Max => "max",
            Self::Unknown => "unknown",
        }
    }
}

/// Classify an inbound payload by originating platform.
///
/// Payload shapes overlap, so the checks run in a fixed order and the first
/// match wins: explicit CRM markers beat bot-shape guesses, the bot update
/// shape beats the session-relay shape, and the Max token marker beats the
/// Max payload shape. Total function: unmatched payloads are `Unknown`.
pub fn detect(payload: &Value, query: &HashMap<String, String>) -> Platform {
    if is_bitrix_shape(payload) {
        return Platform::Bitrix;
    }
    if query.contains_key("bot_token")
        || payload.get("update_id").is_some()
        || has_telegram_triple(payload)
    {
        return Platform::Telegram;
    }
    if payload.get("profile_id").is_some() || payload.get("session_name").is_some() {
        return Platform::SessionRelay;
    }
    if query.contains_key("max_token") {
        return Platform::Max;
    }
    if payload.pointer("/message/recipient").is_some() {
        return Platform::Max;
    }
    Platform::Unknown
}

fn is_bitrix_shape(payload: &Value) -> bool {
    if let Some(event) = payload.get("event").and_then(Value::as_str) {
        if event.eq_ignore_ascii_case(BITRIX_MESSAGE_EVENT)
            || event.eq_ignore_ascii_case(BITRIX_UNINSTALL_EVENT)
        {
            return true;
        }
    }
    if payload.get("PLACEMENT").and_then(Value::as_str) == Some(CONNECTOR_PLACEMENT) {
        return true;
    }
    payload.pointer("/auth/domain").is_some() && payload.pointer("/auth/access_token").is_some()
}

fn has_telegram_triple(payload: &Value) -> bool {
    payload.pointer("/message/from/id").is_some()
        && payload.pointer("/message/chat/id").is_some()
        && payload.pointer("/message/message_id").is_some()
}

/// Classify the content kind of one message object. Field-presence checks
/// in a fixed per-platform priority order, first match wins.
pub fn detect_message_type(message: &Value, platform: Platform) -> MessageType {
    match platform {
        Platform::Telegram => {
            const PRIORITY: &[(&str, MessageType)] = &[
                ("text", MessageType::Text),
                ("photo", MessageType::Photo),
                ("document", MessageType::Document),
                ("voice", MessageType::Voice),
                ("video", MessageType::Video),
                ("audio", MessageType::Audio),
                ("sticker", MessageType::Sticker),
                ("location", MessageType::Location),
                ("contact", MessageType::Contact),
            ];
            for (field, kind) in PRIORITY {
                if message.get(*field).is_some() {
                    return *kind;
                }
            }
            MessageType::Unknown
        }
        Platform::Max => {
            if let Some(kind) = message.get("type").and_then(Value::as_str) {
                return match kind {
                    "text" => MessageType::Text,
                    "image" | "photo" => MessageType::Image,
                    "file" => MessageType::File,
                    "audio" => MessageType::Audio,
                    "video" => MessageType::Video,
                    _ => MessageType::Unknown,
                };
            }
            if message.get("text").is_some() {
                MessageType::Text
            } else if message.get("image_url").is_some() {
                MessageType::Image
            } else if message.get("file_url").is_some() {
                MessageType::File
            } else {
                MessageType::Unknown
            }
        }
        Platform::Bitrix => {
            if message.pointer("/message/files").is_some() {
                MessageType::File
            } else if message.pointer("/message/text").is_some() {
                MessageType::Text
            } else {
                MessageType::Unknown
            }
        }
        Platform::SessionRelay => {
            if message.get("text").is_some() {
                MessageType::Text
            } else {
                MessageType::Unknown
            }
        }
        Platform::Unknown => MessageType::Unknown,
    }
}

/// Extract the namespaced chat identifier for a payload, if present.
/// Max ids gain the namespace prefix here; Telegram and CRM ids pass
/// through unchanged (CRM ids may already carry the prefix from a
/// previous round trip).
pub fn extract_chat_id(payload: &Value, platform: Platform) -> Option<String> {
    match platform {
        Platform::Telegram => payload
            .pointer("/message/chat/id")
            .map(value_to_id),
        Platform::Max => payload
            .pointer("/message/recipient/chat_id")
            .or_else(|| payload.pointer("/message/chat_id"))
            .or_else(|| payload.pointer("/message/chat/id"))
            .or_else(|| payload.pointer("/chat/id"))
            .map(|v| ensure_max_prefix(&value_to_id(v))),
        Platform::Bitrix => payload
            .pointer("/data/MESSAGES/0/chat/id")
            .map(value_to_id),
        Platform::SessionRelay => payload.get("profile_id").map(value_to_id),
        Platform::Unknown => None,
    }
}

/// Whether the message is a reply to another message.
pub fn is_reply(message: &Value, platform: Platform) -> bool {
    match platform {
        Platform::Telegram => message.get("reply_to_message").is_some(),
        Platform::Max => {
            message.pointer("/link/type").and_then(Value::as_str) == Some("reply")
                || message.get("reply_to").is_some()
        }
        _ => false,
    }
}

/// Render a JSON string or number as a bare id string.
fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_query() -> HashMap<String, String> {
        HashMap::new()
    }

    fn query(key: &str) -> HashMap<String, String> {
        HashMap::from([(key.to_string(), "tok".to_string())])
    }

    #[test]
    fn test_bitrix_event_detected() {
        let payload = json!({"event": "ONIMCONNECTORMESSAGEADD", "data": {}});
        assert_eq!(detect(&payload, &no_query()), Platform::Bitrix);
    }

    #[test]
    fn test_bitrix_placement_detected() {
        let payload = json!({"PLACEMENT": "SETTING_CONNECTOR", "PLACEMENT_OPTIONS": "{}"});
        assert_eq!(detect(&payload, &no_query()), Platform::Bitrix);
    }

    #[test]
    fn test_bitrix_auth_pair_detected() {
        let payload = json!({"auth": {"domain": "acme.bitrix24.test", "access_token": "t"}});
        assert_eq!(detect(&payload, &no_query()), Platform::Bitrix);
    }

    #[test]
    fn test_bitrix_wins_over_telegram_shape() {
        // A payload satisfying both the CRM shape and the bot update shape
        // must classify as CRM.
        let payload = json!({
            "event": "ONIMCONNECTORMESSAGEADD",
            "update_id": 1,
            "message": {"message_id": 5, "from": {"id": 42}, "chat": {"id": 42}}
        });
        assert_eq!(detect(&payload, &no_query()), Platform::Bitrix);
    }

    #[test]
    fn test_telegram_by_update_id() {
        let payload = json!({"update_id": 10, "message": {"text": "hi"}});
        assert_eq!(detect(&payload, &no_query()), Platform::Telegram);
    }

    #[test]
    fn test_telegram_by_query_token() {
        assert_eq!(detect(&json!({}), &query("bot_token")), Platform::Telegram);
    }

    #[test]
    fn test_telegram_by_message_triple() {
        let payload = json!({
            "message": {"message_id": 5, "from": {"id": 42, "first_name": "Ann"}, "chat": {"id": 42}, "text": "hi"}
        });
        assert_eq!(detect(&payload, &no_query()), Platform::Telegram);
    }

    #[test]
    fn test_session_relay_after_telegram() {
        // An update-sequence payload with a profile id is still Telegram.
        let payload = json!({"update_id": 3, "profile_id": "p1"});
        assert_eq!(detect(&payload, &no_query()), Platform::Telegram);

        let payload = json!({"profile_id": "p1", "text": "hi"});
        assert_eq!(detect(&payload, &no_query()), Platform::SessionRelay);
        let payload = json!({"session_name": "relay-1"});
        assert_eq!(detect(&payload, &no_query()), Platform::SessionRelay);
    }

    #[test]
    fn test_max_by_query_token() {
        assert_eq!(detect(&json!({}), &query("max_token")), Platform::Max);
    }

    #[test]
    fn test_max_by_recipient_shape() {
        let payload = json!({"message": {"recipient": {"chat_id": "77"}, "text": "hello"}});
        assert_eq!(detect(&payload, &no_query()), Platform::Max);
    }

    #[test]
    fn test_unmatched_is_unknown() {
        assert_eq!(detect(&json!({"foo": "bar"}), &no_query()), Platform::Unknown);
        assert_eq!(detect(&json!({}), &no_query()), Platform::Unknown);
    }

    #[test]
    fn test_message_type_priority_telegram() {
        let m = json!({"text": "hi", "photo": [{}]});
        assert_eq!(detect_message_type(&m, Platform::Telegram), MessageType::Text);
        let m = json!({"photo": [{}], "sticker": {}});
        assert_eq!(detect_message_type(&m, Platform::Telegram), MessageType::Photo);
        let m = json!({"dice": {}});
        assert_eq!(detect_message_type(&m, Platform::Telegram), MessageType::Unknown);
    }

    #[test]
    fn test_message_type_max() {
        let m = json!({"type": "image", "text": "caption"});
        assert_eq!(detect_message_type(&m, Platform::Max), MessageType::Image);
        let m = json!({"text": "hello"});
        assert_eq!(detect_message_type(&m, Platform::Max), MessageType::Text);
        let m = json!({"file_url": "https://x/f.bin"});
        assert_eq!(detect_message_type(&m, Platform::Max), MessageType::File);
    }

    #[test]
    fn test_extract_chat_id_telegram_numeric() {
        let payload = json!({"update_id": 1, "message": {"chat": {"id": 42}}});
        assert_eq!(
            extract_chat_id(&payload, Platform::Telegram),
            Some("42".to_string())
        );
    }

    #[test]
    fn test_extract_chat_id_max_gets_prefix() {
        let payload = json!({"message": {"recipient": {"chat_id": "77"}}});
        assert_eq!(
            extract_chat_id(&payload, Platform::Max),
            Some("max_77".to_string())
        );
        // Already-prefixed ids are left alone.
        let payload = json!({"message": {"chat_id": "max_77"}});
        assert_eq!(
            extract_chat_id(&payload, Platform::Max),
            Some("max_77".to_string())
        );
    }

    #[test]
    fn test_extract_chat_id_bitrix() {
        let payload = json!({"data": {"MESSAGES": [{"chat": {"id": "max_77"}}]}});
        assert_eq!(
            extract_chat_id(&payload, Platform::Bitrix),
            Some("max_77".to_string())
        );
    }

    #[test]
    fn test_is_reply() {
        let m = json!({"reply_to_message": {"message_id": 1}});
        assert!(is_reply(&m, Platform::Telegram));
        let m = json!({"link": {"type": "reply"}});
        assert!(is_reply(&m, Platform::Max));
        assert!(!is_reply(&json!({"text": "hi"}), Platform::Telegram));
    }
}
