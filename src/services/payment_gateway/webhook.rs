//! Inbound payment provider callbacks.
//!
//! Signature header format: `t=<unix seconds>,v1=<hex hmac>` where the MAC is
//! HMAC-SHA256 over `"<t>.<raw body>"`.

use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::orders::AddressInput;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "payment-signature";
/// Accepted for providers that use their own header name
pub const FALLBACK_SIGNATURE_HEADER: &str = "stripe-signature";

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac
}

/// Hex HMAC-SHA256 of `"<timestamp>.<payload>"`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    hex::encode(mac_for(secret, timestamp, payload).finalize().into_bytes())
}

#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance: Duration) -> Self {
        Self {
            secret: secret.into(),
            tolerance,
        }
    }

    pub fn verify(&self, payload: &[u8], header: Option<&str>) -> Result<(), ServiceError> {
        self.verify_at(payload, header, chrono::Utc::now().timestamp())
    }

    /// Checks `header` against `payload` as of `now` (unix seconds).
    pub fn verify_at(
        &self,
        payload: &[u8],
        header: Option<&str>,
        now: i64,
    ) -> Result<(), ServiceError> {
        if self.secret.is_empty() {
            return Err(ServiceError::InvalidSignature(
                "webhook secret is not configured".into(),
            ));
        }
        let header = header
            .ok_or_else(|| ServiceError::InvalidSignature("missing signature header".into()))?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| ServiceError::InvalidSignature("missing or malformed timestamp".into()))?;
        if candidates.is_empty() {
            return Err(ServiceError::InvalidSignature("missing v1 signature".into()));
        }

        if now.abs_diff(timestamp) > self.tolerance.as_secs() {
            return Err(ServiceError::InvalidSignature(format!(
                "timestamp {} outside tolerance",
                timestamp
            )));
        }

        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|bytes| mac_for(&self.secret, timestamp, payload).verify_slice(&bytes).is_ok())
                .unwrap_or(false)
        });

        if matched {
            Ok(())
        } else {
            Err(ServiceError::InvalidSignature("signature mismatch".into()))
        }
    }

    /// Builds a header value for `payload`, as the provider would.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        format!(
            "t={},v1={}",
            timestamp,
            sign_payload(&self.secret, timestamp, payload)
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentMetadata {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderAddress {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderShipping {
    pub name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub address: ProviderAddress,
}

impl ProviderShipping {
    /// Usable only when every required address field is present.
    pub fn to_address_input(&self) -> Option<AddressInput> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        Some(AddressInput {
            name: non_empty(&self.name)?,
            line1: non_empty(&self.address.line1)?,
            line2: non_empty(&self.address.line2),
            city: non_empty(&self.address.city)?,
            region: non_empty(&self.address.state),
            postal_code: non_empty(&self.address.postal_code)?,
            country: non_empty(&self.address.country)?.to_uppercase(),
            phone: non_empty(&self.phone),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentObject {
    pub id: String,
    /// Set on charge objects; points at the authorization
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: PaymentMetadata,
    #[serde(default)]
    pub shipping: Option<ProviderShipping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEventData {
    pub object: PaymentObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: Option<i64>,
    pub data: PaymentEventData,
}

impl PaymentEvent {
    pub fn parse(payload: &[u8]) -> Result<Self, ServiceError> {
        let event: PaymentEvent = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::BadRequest(format!("malformed webhook payload: {}", e)))?;
        if event.id.trim().is_empty() {
            return Err(ServiceError::BadRequest("webhook event id is empty".into()));
        }
        Ok(event)
    }

    /// The authorization this event concerns.
    pub fn authorization_reference(&self) -> &str {
        self.data
            .object
            .payment_intent
            .as_deref()
            .unwrap_or(&self.data.object.id)
    }

    pub fn metadata_order_id(&self) -> Option<Uuid> {
        let raw = self.data.object.metadata.order_id.as_deref()?;
        match Uuid::parse_str(raw.trim()) {
            Ok(id) => Some(id),
            Err(_) => {
                warn!(event_id = %self.id, "ignoring malformed order_id in event metadata");
                None
            }
        }
    }

    pub fn metadata_order_number(&self) -> Option<&str> {
        self.data
            .object
            .metadata
            .order_number
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn shipping_address(&self) -> Option<AddressInput> {
        self.data
            .object
            .shipping
            .as_ref()
            .and_then(ProviderShipping::to_address_input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000;

    fn verifier() -> WebhookVerifier {
        WebhookVerifier::new("whsec_test", Duration::from_secs(300))
    }

    #[test]
    fn accepts_its_own_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = verifier().sign(payload, NOW);
        verifier().verify_at(payload, Some(&header), NOW + 10).unwrap();
    }

    #[test]
    fn accepts_any_matching_v1_candidate() {
        let payload = br#"{"id":"evt_1"}"#;
        let good = sign_payload("whsec_test", NOW, payload);
        let header = format!("t={},v1=deadbeef,v1={}", NOW, good);
        verifier().verify_at(payload, Some(&header), NOW).unwrap();
    }

    #[test]
    fn rejects_tampered_payload() {
        let header = verifier().sign(br#"{"id":"evt_1"}"#, NOW);
        assert_matches!(
            verifier().verify_at(br#"{"id":"evt_2"}"#, Some(&header), NOW),
            Err(ServiceError::InvalidSignature(_))
        );
    }

    #[test]
    fn rejects_stale_timestamp() {
        let payload = b"{}";
        let header = verifier().sign(payload, NOW);
        assert_matches!(
            verifier().verify_at(payload, Some(&header), NOW + 301),
            Err(ServiceError::InvalidSignature(msg)) if msg.contains("tolerance")
        );
    }

    #[test]
    fn rejects_missing_or_malformed_headers() {
        for header in [None, Some(""), Some("v1=abc"), Some("t=abc,v1=00"), Some("t=1700000000")] {
            assert_matches!(
                verifier().verify_at(b"{}", header, NOW),
                Err(ServiceError::InvalidSignature(_))
            );
        }
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let unsigned = WebhookVerifier::new("", Duration::from_secs(300));
        let header = unsigned.sign(b"{}", NOW);
        assert_matches!(
            unsigned.verify_at(b"{}", Some(&header), NOW),
            Err(ServiceError::InvalidSignature(_))
        );
    }

    #[test]
    fn parses_charge_event_with_metadata_and_shipping() {
        let order_id = Uuid::new_v4();
        let payload = json!({
            "id": "evt_123",
            "type": "charge.succeeded",
            "data": { "object": {
                "id": "ch_1",
                "payment_intent": "pi_1",
                "metadata": { "order_id": order_id.to_string(), "order_number": "ORD-20240101-AAAA0000" },
                "shipping": {
                    "name": "Ada Lovelace",
                    "address": { "line1": "1 Main St", "city": "London", "postal_code": "N1 1AA", "country": "gb" }
                }
            }}
        });

        let event = PaymentEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.authorization_reference(), "pi_1");
        assert_eq!(event.metadata_order_id(), Some(order_id));
        assert_eq!(event.metadata_order_number(), Some("ORD-20240101-AAAA0000"));

        let address = event.shipping_address().unwrap();
        assert_eq!(address.country, "GB");
        assert_eq!(address.line2, None);
    }

    #[test]
    fn intent_event_uses_its_own_id_as_reference() {
        let payload = json!({
            "id": "evt_9",
            "type": "payment_intent.succeeded",
            "data": { "object": { "id": "pi_9", "metadata": { "order_id": "not-a-uuid" } } }
        });
        let event = PaymentEvent::parse(payload.to_string().as_bytes()).unwrap();
        assert_eq!(event.authorization_reference(), "pi_9");
        assert_eq!(event.metadata_order_id(), None);
        assert!(event.shipping_address().is_none());
    }

    #[test]
    fn malformed_payload_is_a_bad_request() {
        assert_matches!(PaymentEvent::parse(b"not json"), Err(ServiceError::BadRequest(_)));
        assert_matches!(
            PaymentEvent::parse(br#"{"id":"","type":"x","data":{"object":{"id":"a"}}}"#),
            Err(ServiceError::BadRequest(_))
        );
    }
}
