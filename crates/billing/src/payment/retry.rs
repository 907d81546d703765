//! Retry classification and backoff for gateway calls

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_retry::RetryIf;

use super::gateway::{GatewayError, NetworkErrorKind};
use crate::config::PaymentConfig;

/// Provider codes caused by the customer's payment method. Never retried.
const TERMINAL_CODES: &[&str] = &[
    "card_declined",
    "expired_card",
    "incorrect_cvc",
    "incorrect_number",
    "invalid_cvc",
    "invalid_expiry_month",
    "invalid_expiry_year",
    "insufficient_funds",
    "authentication_required",
    "payment_intent_authentication_failure",
    "payment_method_unactivated",
    "processing_error_declined",
];

/// Provider codes for contention on the provider side
const RETRYABLE_CODES: &[&str] = &["rate_limit", "lock_timeout"];

/// Decides whether a failed gateway call is worth repeating and how long to wait
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PaymentConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            max_retries,
            base,
            max,
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &PaymentConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_base,
            config.retry_max,
            config.jitter_ratio,
        )
    }

    /// Transient failures only. Anything unrecognised is terminal.
    pub fn is_retryable(err: &GatewayError) -> bool {
        match err {
            GatewayError::Provider { status, code, .. } => {
                if let Some(code) = code.as_deref() {
                    if TERMINAL_CODES.contains(&code) {
                        return false;
                    }
                    if RETRYABLE_CODES.contains(&code) {
                        return true;
                    }
                }
                *status == 429 || (500..600).contains(status)
            }
            GatewayError::Timeout => true,
            GatewayError::Network { kind, .. } => !matches!(kind, NetworkErrorKind::Other),
            GatewayError::RequiresAction { .. } | GatewayError::InvalidRequest(_) => false,
        }
    }

    /// Delay before retry number `retry` (0-based), before jitter:
    /// `base * 2^retry`, capped at `max`
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delays between attempts: one per retry, jittered by ±`jitter_ratio`
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let policy = self.clone();
        (0..self.max_retries as u32).map(move |retry| policy.jittered(policy.base_delay(retry)))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_ratio == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        delay.mul_f64(factor).min(self.max)
    }

    /// Run `action` until it succeeds, fails terminally or retries run out
    pub async fn run<T, A, Fut>(&self, action: A) -> Result<T, GatewayError>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        RetryIf::spawn(self.delays(), action, |err: &GatewayError| {
            let retry = Self::is_retryable(err);
            tracing::debug!(error = %err, retry, "Gateway call failed");
            retry
        })
        .await
    }
}
