//! Webhook ingress: signature verification and payload normalization.
//!
//! The provider signs each delivery with a shared secret using the
//! `t=<timestamp>,v1=<hex hmac-sha256("<timestamp>.<payload>")>` header
//! scheme. A delivery that fails verification must cause no state change at
//! all; only verified payloads are normalized into events.

use hmac::{Hmac, Mac};
use model::NormalizedPaymentEvent;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed delivery, in seconds. Rejecting stale
/// timestamps limits replay of captured webhook bodies.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const FALLBACK_FAILURE_REASON: &str = "unknown payment error";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// Verifies the provider signature header against the raw payload.
pub fn verify_signature(
    secret: &str,
    payload: &[u8],
    signature_header: &str,
) -> Result<(), WebhookError> {
    verify_signature_at(secret, payload, signature_header, unix_now())
}

/// Verification against an explicit clock, used directly by tests.
fn verify_signature_at(
    secret: &str,
    payload: &[u8],
    signature_header: &str,
    now: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in signature_header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = value.parse().ok();
            }
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(WebhookError::InvalidSignature);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(WebhookError::InvalidSignature);
    }

    for signature in &signatures {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice is a constant-time comparison.
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }

    Err(WebhookError::InvalidSignature)
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: EventData,
}

#[derive(Debug, Deserialize)]
struct EventData {
    object: IntentObject,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    id: String,
    #[serde(default)]
    last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Deserialize)]
struct LastPaymentError {
    message: Option<String>,
}

/// Parses a verified payload into a normalized event. Unknown event types
/// are not delivery failures; they normalize to `Unhandled` and are
/// acknowledged upstream.
pub fn parse_event(payload: &[u8]) -> Result<NormalizedPaymentEvent, WebhookError> {
    let event: WebhookEvent = serde_json::from_slice(payload)
        .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    let event = match event.event_type.as_str() {
        "payment_intent.succeeded" => NormalizedPaymentEvent::Succeeded {
            provider_transaction_id: event.data.object.id,
        },
        "payment_intent.payment_failed" => {
            let reason = event
                .data
                .object
                .last_payment_error
                .and_then(|e| e.message)
                .unwrap_or_else(|| FALLBACK_FAILURE_REASON.to_string());
            NormalizedPaymentEvent::Failed {
                provider_transaction_id: event.data.object.id,
                reason,
            }
        }
        _ => NormalizedPaymentEvent::Unhandled {
            event_type: event.event_type,
        },
    };
    Ok(event)
}
