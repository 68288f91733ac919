use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

/// Reject signatures whose timestamp strays further than this from now.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Typed gateway event. The wire shape nests the payment object under
/// `data.object`; everything the reconciler needs is lifted into explicit
/// optional fields instead of being read out of raw JSON.
#[derive(Debug, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

#[derive(Debug, Deserialize)]
pub struct EventObject {
    pub id: String,
    #[serde(default)]
    pub metadata: EventMetadata,
    /// Refunded amount in minor currency units (cents).
    #[serde(default)]
    pub amount_refunded: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventMetadata {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub order_number: Option<String>,
}

/// Verify the `Stripe-Signature` header against the shared secret and parse
/// the payload into a [`GatewayEvent`]. Signature failures map to 401 so the
/// gateway retries; a payload that verifies but does not parse is a 400.
pub fn construct_event(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
) -> AppResult<GatewayEvent> {
    verify_signature(payload, signature_header, secret, Utc::now().timestamp())?;
    serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("invalid event payload: {e}")))
}

// Stripe-style header: `t=<unix ts>,v1=<hex hmac of "<ts>.<payload>">`.
fn verify_signature(payload: &[u8], header: &str, secret: &str, now: i64) -> AppResult<()> {
    let mut ts = "";
    let mut v1 = "";
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", val)) => ts = val,
            Some(("v1", val)) => v1 = val,
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return Err(AppError::Unauthorized("malformed signature header".into()));
    }

    let ts_num: i64 = ts
        .parse()
        .map_err(|_| AppError::Unauthorized("malformed signature timestamp".into()))?;
    if (now - ts_num).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(AppError::Unauthorized("signature timestamp expired".into()));
    }

    let expected = sign(payload, ts, secret)?;
    if !constant_time_eq(&expected, v1) {
        return Err(AppError::Unauthorized("invalid webhook signature".into()));
    }
    Ok(())
}

fn sign(payload: &[u8], ts: &str, secret: &str) -> AppResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Unauthorized("invalid webhook secret".into()))?;
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn signed_header(payload: &[u8], ts: i64) -> String {
        let sig = sign(payload, &ts.to_string(), SECRET).unwrap();
        format!("t={ts},v1={sig}")
    }

    #[test]
    fn valid_signature_passes() {
        let payload = br#"{"id":"evt_1","type":"payment_intent.succeeded","data":{"object":{"id":"pi_1"}}}"#;
        let header = signed_header(payload, 1_700_000_000);
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, 1_700_000_000);
        let err = verify_signature(b"{\"id\":\"evt_2\"}", &header, SECRET, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let sig = sign(payload, "1700000000", "whsec_other").unwrap();
        let header = format!("t=1700000000,v1={sig}");
        assert!(verify_signature(payload, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = signed_header(payload, 1_700_000_000);
        let err = verify_signature(
            payload,
            &header,
            SECRET,
            1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn missing_parts_are_rejected() {
        assert!(verify_signature(b"{}", "v1=abc", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "t=123", SECRET, 0).is_err());
        assert!(verify_signature(b"{}", "", SECRET, 0).is_err());
    }

    #[test]
    fn event_parses_metadata_and_refund_amount() {
        let payload = br#"{
            "id": "evt_9",
            "type": "charge.refunded",
            "data": {
                "object": {
                    "id": "ch_1",
                    "amount_refunded": 6175,
                    "metadata": {
                        "order_id": "7b7f7e58-4c85-4f4f-9f30-111111111111",
                        "user_email": "shopper@example.com",
                        "order_number": "ORD-20260827-0001"
                    }
                }
            }
        }"#;
        let event: GatewayEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(event.event_type, "charge.refunded");
        assert_eq!(event.data.object.amount_refunded, Some(6175));
        assert_eq!(
            event.data.object.metadata.order_number.as_deref(),
            Some("ORD-20260827-0001")
        );
    }

    #[test]
    fn event_without_metadata_still_parses() {
        let payload =
            br#"{"id":"evt_2","type":"payment_intent.succeeded","data":{"object":{"id":"pi_2"}}}"#;
        let event: GatewayEvent = serde_json::from_slice(payload).unwrap();
        assert!(event.data.object.metadata.order_id.is_none());
        assert!(event.data.object.amount_refunded.is_none());
    }
}
