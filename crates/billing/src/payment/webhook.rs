//! Stripe webhook verification and normalization
//!
//! Signature header format: `t=<unix seconds>,v1=<hex hmac>[,v1=...]`.
//! The signed payload is `"{t}.{body}"` keyed with the endpoint secret.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use time::OffsetDateTime;

use super::models::PaymentStatus;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed event, in seconds
const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Provider-neutral view of an asynchronous payment result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPaymentEvent {
    pub provider: String,
    pub provider_payment_id: String,
    pub status: PaymentStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

pub struct StripeWebhookVerifier {
    secret: String,
    tolerance_secs: u64,
}

impl StripeWebhookVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    /// Verify the `Stripe-Signature` header and normalize the event.
    ///
    /// Returns `Ok(None)` for authentic events that carry no payment result.
    pub fn verify_and_parse(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<Option<NormalizedPaymentEvent>> {
        self.verify_at(payload, signature_header, OffsetDateTime::now_utc().unix_timestamp())?;
        parse_event(payload)
    }

    fn verify_at(&self, payload: &str, signature_header: &str, now: i64) -> BillingResult<()> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in signature_header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        if signatures.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }
        let within_tolerance = now
            .checked_sub(timestamp)
            .is_some_and(|skew| skew.unsigned_abs() <= self.tolerance_secs);
        if !within_tolerance {
            tracing::warn!(timestamp, now, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let expected = sign(&self.secret, timestamp, payload)?;
        if signatures
            .iter()
            .any(|candidate| constant_time_compare(candidate, &expected))
        {
            Ok(())
        } else {
            tracing::warn!("Webhook signature mismatch");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }
}

fn sign(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn parse_event(payload: &str) -> BillingResult<Option<NormalizedPaymentEvent>> {
    let event: Value = serde_json::from_str(payload)?;
    let event_type = event["type"].as_str().unwrap_or_default();

    let status = match event_type {
        "payment_intent.succeeded" => PaymentStatus::Succeeded,
        "payment_intent.payment_failed" => PaymentStatus::Failed,
        other => {
            tracing::debug!(event_type = other, "Ignoring webhook event");
            return Ok(None);
        }
    };

    let object = &event["data"]["object"];
    let provider_payment_id = object["id"]
        .as_str()
        .ok_or_else(|| BillingError::InvalidInput("webhook event has no object id".to_string()))?
        .to_string();

    let (error_code, error_message) = if status == PaymentStatus::Failed {
        let error = &object["last_payment_error"];
        (
            error["code"].as_str().map(str::to_string),
            error["message"].as_str().map(str::to_string),
        )
    } else {
        (None, None)
    };

    Ok(Some(NormalizedPaymentEvent {
        provider: "Stripe".to_string(),
        provider_payment_id,
        status,
        error_code,
        error_message,
    }))
}
