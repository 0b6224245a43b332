//! Payment gateway webhook verification and event mapping.
//!
//! The gateway signs each delivery with HMAC-SHA256 over the raw request body
//! using the configured webhook secret. Verification only runs when both the
//! secret and the signature header are present; with either missing the
//! delivery is processed unverified (the gateway's sandbox does not sign).

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

pub const GATEWAY_SIGNATURE_HEADER: &str = "x-razorpay-signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Valid,
    Invalid,
    Skipped,
}

pub fn verify_gateway_signature(
    secret: &str,
    signature_header: Option<&str>,
    body: &[u8],
) -> SignatureCheck {
    if secret.is_empty() {
        return SignatureCheck::Skipped;
    }
    let Some(signature) = signature_header.map(str::trim).filter(|s| !s.is_empty()) else {
        return SignatureCheck::Skipped;
    };
    let Ok(signature_bytes) = hex::decode(signature) else {
        return SignatureCheck::Invalid;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return SignatureCheck::Invalid;
    };
    mac.update(body);
    if mac.verify_slice(&signature_bytes).is_ok() {
        SignatureCheck::Valid
    } else {
        SignatureCheck::Invalid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    Paid,
    Cancelled,
    Expired,
}

impl PaymentTransition {
    pub fn status(self) -> &'static str {
        match self {
            PaymentTransition::Paid => "paid",
            PaymentTransition::Cancelled => "cancelled",
            PaymentTransition::Expired => "expired",
        }
    }
}

/// Fixed event table. Anything not listed is acknowledged and ignored.
pub fn transition_for_event(event: &str) -> Option<PaymentTransition> {
    match event {
        "payment_link.paid" => Some(PaymentTransition::Paid),
        "payment_link.cancelled" => Some(PaymentTransition::Cancelled),
        "payment_link.expired" => Some(PaymentTransition::Expired),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { link_id: String, status: &'static str },
    Ignored { reason: String },
}

pub fn event_name(payload: &Value) -> String {
    payload
        .get("event")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The gateway's link id, from the nested entity envelope or a flat field.
pub fn payment_link_id(payload: &Value) -> Option<String> {
    non_empty(payload.pointer("/payload/payment_link/entity/id"))
        .or_else(|| non_empty(payload.pointer("/payload/payment_link/id")))
        .or_else(|| non_empty(payload.get("payment_link_id")))
}

/// The gateway's payment id, present on paid events.
pub fn gateway_payment_id(payload: &Value) -> Option<String> {
    non_empty(payload.pointer("/payload/payment/entity/id"))
        .or_else(|| non_empty(payload.get("payment_id")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn valid_signature_passes() {
        let body = br#"{"event":"payment_link.paid"}"#;
        let signature = sign("whsec", body);
        assert_eq!(
            verify_gateway_signature("whsec", Some(&signature), body),
            SignatureCheck::Valid
        );
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let body = br#"{"event":"payment_link.paid"}"#;
        let signature = sign("other-secret", body);
        assert_eq!(
            verify_gateway_signature("whsec", Some(&signature), body),
            SignatureCheck::Invalid
        );
    }

    #[test]
    fn tampered_body_is_rejected() {
        let signature = sign("whsec", b"original");
        assert_eq!(
            verify_gateway_signature("whsec", Some(&signature), b"tampered"),
            SignatureCheck::Invalid
        );
    }

    #[test]
    fn non_hex_signature_is_rejected() {
        assert_eq!(
            verify_gateway_signature("whsec", Some("not hex"), b"{}"),
            SignatureCheck::Invalid
        );
    }

    #[test]
    fn missing_secret_skips_verification() {
        assert_eq!(
            verify_gateway_signature("", Some("deadbeef"), b"{}"),
            SignatureCheck::Skipped
        );
    }

    #[test]
    fn missing_header_skips_verification() {
        assert_eq!(
            verify_gateway_signature("whsec", None, b"{}"),
            SignatureCheck::Skipped
        );
        assert_eq!(
            verify_gateway_signature("whsec", Some("  "), b"{}"),
            SignatureCheck::Skipped
        );
    }

    #[test]
    fn event_table_maps_the_three_transitions() {
        assert_eq!(
            transition_for_event("payment_link.paid"),
            Some(PaymentTransition::Paid)
        );
        assert_eq!(
            transition_for_event("payment_link.cancelled"),
            Some(PaymentTransition::Cancelled)
        );
        assert_eq!(
            transition_for_event("payment_link.expired"),
            Some(PaymentTransition::Expired)
        );
    }

    #[test]
    fn unknown_events_map_to_none() {
        assert_eq!(transition_for_event("payment_link.partially_paid"), None);
        assert_eq!(transition_for_event("order.paid"), None);
        assert_eq!(transition_for_event(""), None);
    }

    #[test]
    fn link_id_from_nested_entity_envelope() {
        let payload = json!({
            "event": "payment_link.paid",
            "payload": {
                "payment_link": { "entity": { "id": "plink_Mk3X" } },
                "payment": { "entity": { "id": "pay_9aB" } }
            }
        });
        assert_eq!(payment_link_id(&payload).as_deref(), Some("plink_Mk3X"));
        assert_eq!(gateway_payment_id(&payload).as_deref(), Some("pay_9aB"));
    }

    #[test]
    fn link_id_from_flat_field() {
        let payload = json!({ "event": "payment_link.expired", "payment_link_id": "plink_Flat" });
        assert_eq!(payment_link_id(&payload).as_deref(), Some("plink_Flat"));
        assert_eq!(gateway_payment_id(&payload), None);
    }

    #[test]
    fn missing_link_id_is_none() {
        let payload = json!({ "event": "payment_link.paid", "payload": {} });
        assert_eq!(payment_link_id(&payload), None);
    }
}
