//! Inbound webhook payload normalization.
//!
//! The provider delivers the same logical message under several field
//! spellings depending on API version and relay. Each logical field has an
//! ordered alias list tried in sequence; the first present, non-empty value
//! wins. Extraction happens before any datastore write, so a payload we
//! cannot attribute to a sender is rejected without side effects.

use serde_json::{json, Value};

pub const SENDER_PHONE_KEYS: &[&str] = &["customerNumber", "from", "sender", "mobile", "phone"];
pub const RECEIVER_NUMBER_KEYS: &[&str] = &["receiverNumber", "to", "businessNumber", "waNumber"];
pub const BODY_KEYS: &[&str] = &["text", "body", "message", "content"];
pub const CONTENT_TYPE_KEYS: &[&str] = &["type", "messageType", "contentType"];
pub const MEDIA_URL_KEYS: &[&str] = &["mediaUrl", "media", "fileUrl", "url"];
pub const FILE_NAME_KEYS: &[&str] = &["fileName", "filename", "documentName"];
pub const EXTERNAL_ID_KEYS: &[&str] = &["id", "messageId", "whatsappMessageId"];
pub const SENDER_NAME_KEYS: &[&str] = &["senderName", "pushname", "profileName", "name"];

/// Fallback conversation key when the payload does not say which business
/// number received the message.
pub const DEFAULT_BUSINESS_NUMBER: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    MissingSenderPhone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub sender_phone: String,
    pub receiver_number: String,
    pub content_type: String,
    pub body_text: String,
    pub media_url: String,
    pub file_name: String,
    pub external_id: String,
    pub sender_name: String,
    pub location: Option<Value>,
    pub contacts: Option<Value>,
}

/// Canonical phone key: whitespace removed, one leading `+` stripped. The
/// digit string the provider sends is otherwise kept as-is.
pub fn normalize_phone(raw: &str) -> String {
    let compact = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>();
    compact
        .strip_prefix('+')
        .unwrap_or(compact.as_str())
        .to_string()
}

fn first_string(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match payload.get(key) {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn first_value<'a>(payload: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| payload.get(key))
        .find(|v| !v.is_null())
}

/// Some upstream relays double-encode the body: a JSON string whose content
/// is itself a JSON object carrying the real `text`.
fn unwrap_double_encoded(text: &str) -> String {
    if text.starts_with('{') {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            if let Some(inner) = parsed.get("text").and_then(Value::as_str) {
                return inner.trim().to_string();
            }
        }
    }
    text.to_string()
}

fn resolve_body_text(payload: &Value) -> String {
    let Some(raw) = first_value(payload, BODY_KEYS) else {
        return String::new();
    };
    match raw {
        Value::String(s) => unwrap_double_encoded(s.trim()),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
        other => other.to_string(),
    }
}

fn location_display_body(block: &Value) -> String {
    let label = block
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            block
                .get("address")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or("Shared Location");
    format!("[Location: {label}]")
}

fn contact_display_body(block: &Value) -> String {
    let first = match block {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    let label = first
        .and_then(|card| {
            card.get("name")
                .and_then(|n| n.get("formatted_name"))
                .and_then(Value::as_str)
                .or_else(|| card.get("formattedName").and_then(Value::as_str))
                .or_else(|| card.get("name").and_then(Value::as_str))
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("Shared Contact");
    format!("[Contact: {label}]")
}

pub fn extract_inbound(payload: &Value) -> Result<InboundMessage, ExtractError> {
    let sender_raw =
        first_string(payload, SENDER_PHONE_KEYS).ok_or(ExtractError::MissingSenderPhone)?;
    let sender_phone = normalize_phone(&sender_raw);
    if sender_phone.is_empty() {
        return Err(ExtractError::MissingSenderPhone);
    }

    let receiver_number = first_string(payload, RECEIVER_NUMBER_KEYS)
        .map(|raw| normalize_phone(&raw))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| DEFAULT_BUSINESS_NUMBER.to_string());

    let mut content_type = first_string(payload, CONTENT_TYPE_KEYS)
        .unwrap_or_else(|| "text".to_string())
        .to_ascii_lowercase();
    let mut body_text = resolve_body_text(payload);
    let mut location = None;
    let mut contacts = None;

    if content_type == "location" {
        if let Some(block) = payload.get("location").filter(|v| v.is_object()) {
            if body_text.is_empty() {
                body_text = location_display_body(block);
            }
            location = Some(block.clone());
        }
    }

    if content_type == "contacts" || content_type == "contact" {
        content_type = "contact".to_string();
        let block = payload
            .get("contacts")
            .or_else(|| payload.get("contact"))
            .filter(|v| !v.is_null());
        if let Some(block) = block {
            if body_text.is_empty() {
                body_text = contact_display_body(block);
            }
            contacts = Some(block.clone());
        }
    }

    Ok(InboundMessage {
        sender_phone,
        receiver_number,
        content_type,
        body_text,
        media_url: first_string(payload, MEDIA_URL_KEYS).unwrap_or_default(),
        file_name: first_string(payload, FILE_NAME_KEYS).unwrap_or_default(),
        external_id: first_string(payload, EXTERNAL_ID_KEYS).unwrap_or_default(),
        sender_name: first_string(payload, SENDER_NAME_KEYS).unwrap_or_default(),
        location,
        contacts,
    })
}

/// Stored message body. Location and contact-card messages keep their raw
/// structured payload inside a JSON envelope next to the display text; the
/// renderer parses the envelope back out.
pub fn encode_message_body(inbound: &InboundMessage) -> String {
    if inbound.content_type == "location" {
        if let Some(location) = &inbound.location {
            return json!({ "text": inbound.body_text, "location": location }).to_string();
        }
    }
    if inbound.content_type == "contact" {
        if let Some(contacts) = &inbound.contacts {
            return json!({ "text": inbound.body_text, "contacts": contacts }).to_string();
        }
    }
    inbound.body_text.clone()
}

/// Conversation list preview for a message body.
pub fn message_preview(body_text: &str) -> String {
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        "[media]".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_phone_strips_leading_plus() {
        assert_eq!(normalize_phone("+919876543210"), "919876543210");
        assert_eq!(normalize_phone("919876543210"), "919876543210");
    }

    #[test]
    fn normalize_phone_is_idempotent_over_plus() {
        let bare = "919876543210";
        assert_eq!(normalize_phone(bare), normalize_phone(&format!("+{bare}")));
    }

    #[test]
    fn normalize_phone_drops_whitespace() {
        assert_eq!(normalize_phone(" +91 98765 43210 "), "919876543210");
    }

    #[test]
    fn normalize_phone_strips_only_one_plus() {
        assert_eq!(normalize_phone("++91"), "+91");
    }

    #[test]
    fn extract_fails_without_any_sender_alias() {
        let payload = json!({ "text": "hello", "type": "text" });
        assert_eq!(
            extract_inbound(&payload),
            Err(ExtractError::MissingSenderPhone)
        );
    }

    #[test]
    fn extract_fails_on_blank_sender_phone() {
        let payload = json!({ "from": "  + ", "text": "hello" });
        assert_eq!(
            extract_inbound(&payload),
            Err(ExtractError::MissingSenderPhone)
        );
    }

    #[test]
    fn sender_alias_order_prefers_customer_number() {
        let payload = json!({
            "customerNumber": "+911111111111",
            "from": "+922222222222",
            "text": "hi"
        });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.sender_phone, "911111111111");
    }

    #[test]
    fn sender_alias_skips_empty_values() {
        let payload = json!({ "customerNumber": "", "from": "+919876543210", "text": "hi" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.sender_phone, "919876543210");
    }

    #[test]
    fn numeric_sender_phone_is_accepted() {
        let payload = json!({ "from": 919876543210u64, "text": "hi" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.sender_phone, "919876543210");
    }

    #[test]
    fn receiver_number_defaults_when_absent() {
        let payload = json!({ "from": "919876543210", "text": "hi" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.receiver_number, DEFAULT_BUSINESS_NUMBER);
    }

    #[test]
    fn receiver_number_is_normalized() {
        let payload = json!({ "from": "919876543210", "to": "+918888888888", "text": "hi" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.receiver_number, "918888888888");
    }

    #[test]
    fn plain_text_body_passes_through() {
        let payload = json!({ "from": "919876543210", "text": "Hi", "type": "text" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "Hi");
        assert_eq!(inbound.content_type, "text");
    }

    #[test]
    fn composite_body_object_unwraps_nested_text() {
        let payload = json!({ "from": "919876543210", "text": { "text": "nested" } });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "nested");
    }

    #[test]
    fn composite_body_without_text_field_is_serialized() {
        let payload = json!({ "from": "919876543210", "text": { "caption": "pic" } });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, r#"{"caption":"pic"}"#);
    }

    #[test]
    fn double_encoded_body_string_unwraps() {
        let payload = json!({ "from": "919876543210", "text": "{\"text\":\"hello\"}" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "hello");
    }

    #[test]
    fn json_looking_body_without_text_field_stays_raw() {
        let payload = json!({ "from": "919876543210", "text": "{\"foo\":1}" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "{\"foo\":1}");
    }

    #[test]
    fn location_synthesizes_display_body_and_keeps_block() {
        let payload = json!({
            "from": "919876543210",
            "type": "location",
            "location": { "latitude": 12.9, "longitude": 77.6, "name": "Office" }
        });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "[Location: Office]");
        assert!(inbound.location.is_some());
    }

    #[test]
    fn location_falls_back_to_address_then_generic() {
        let with_address = json!({
            "from": "1", "type": "location",
            "location": { "address": "1 Main St" }
        });
        assert_eq!(
            extract_inbound(&with_address).unwrap().body_text,
            "[Location: 1 Main St]"
        );

        let bare = json!({
            "from": "1", "type": "location",
            "location": { "latitude": 0.1, "longitude": 0.2 }
        });
        assert_eq!(
            extract_inbound(&bare).unwrap().body_text,
            "[Location: Shared Location]"
        );
    }

    #[test]
    fn location_keeps_caption_body_when_present() {
        let payload = json!({
            "from": "1",
            "type": "location",
            "text": "meet here",
            "location": { "name": "Office" }
        });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "meet here");
        assert!(inbound.location.is_some());
    }

    #[test]
    fn contacts_type_normalizes_to_contact() {
        let payload = json!({
            "from": "1",
            "type": "contacts",
            "contacts": [ { "name": { "formatted_name": "Asha Rao" } } ]
        });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.content_type, "contact");
        assert_eq!(inbound.body_text, "[Contact: Asha Rao]");
        assert!(inbound.contacts.is_some());
    }

    #[test]
    fn contact_card_without_name_uses_generic_label() {
        let payload = json!({ "from": "1", "type": "contact", "contacts": [{}] });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.body_text, "[Contact: Shared Contact]");
    }

    #[test]
    fn media_fields_are_extracted() {
        let payload = json!({
            "from": "1",
            "type": "document",
            "mediaUrl": "https://cdn.example/doc.pdf",
            "fileName": "doc.pdf",
            "messageId": "wamid.123",
            "senderName": "Asha"
        });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(inbound.media_url, "https://cdn.example/doc.pdf");
        assert_eq!(inbound.file_name, "doc.pdf");
        assert_eq!(inbound.external_id, "wamid.123");
        assert_eq!(inbound.sender_name, "Asha");
        assert_eq!(inbound.body_text, "");
    }

    #[test]
    fn encode_body_wraps_location_in_envelope() {
        let payload = json!({
            "from": "1",
            "type": "location",
            "location": { "latitude": 1.0, "longitude": 2.0, "name": "Spot" }
        });
        let inbound = extract_inbound(&payload).unwrap();
        let encoded = encode_message_body(&inbound);
        let parsed: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed["text"], "[Location: Spot]");
        assert_eq!(parsed["location"]["latitude"], 1.0);
    }

    #[test]
    fn encode_body_wraps_contacts_in_envelope() {
        let payload = json!({
            "from": "1",
            "type": "contacts",
            "contacts": [ { "name": { "formatted_name": "Asha" } } ]
        });
        let inbound = extract_inbound(&payload).unwrap();
        let parsed: Value = serde_json::from_str(&encode_message_body(&inbound)).unwrap();
        assert_eq!(parsed["text"], "[Contact: Asha]");
        assert!(parsed["contacts"].is_array());
    }

    #[test]
    fn encode_body_is_plain_for_text() {
        let payload = json!({ "from": "1", "text": "Hi" });
        let inbound = extract_inbound(&payload).unwrap();
        assert_eq!(encode_message_body(&inbound), "Hi");
    }

    #[test]
    fn preview_falls_back_to_media_marker() {
        assert_eq!(message_preview("  "), "[media]");
        assert_eq!(message_preview("Hi"), "Hi");
    }
}
