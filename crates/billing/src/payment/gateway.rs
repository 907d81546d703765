//! Payment gateway contract

use async_trait::async_trait;
use thiserror::Error;

use super::models::{PaymentRequest, PaymentResult, PaymentStatus};

/// Transport-level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnectionRefused,
    ConnectionReset,
    /// DNS hiccups, temporary unavailability and similar
    Temporary,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The provider answered with an error response
    #[error("provider error (HTTP {status}, code {}): {message}", code.as_deref().unwrap_or("none"))]
    Provider {
        status: u16,
        code: Option<String>,
        message: String,
        /// Set when the provider created a payment before failing it
        payment_id: Option<String>,
    },

    #[error("gateway call timed out")]
    Timeout,

    #[error("network error ({kind:?}): {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
    },

    /// Off-session charge demanded customer authentication
    #[error("payment {payment_id} requires customer action")]
    RequiresAction { payment_id: String },

    #[error("invalid payment request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    /// Code stored on a failed attempt
    pub fn error_code(&self) -> String {
        match self {
            GatewayError::Provider {
                code: Some(code), ..
            } => code.clone(),
            GatewayError::Provider { .. } => "payment_failed".to_string(),
            GatewayError::Timeout => "gateway_timeout".to_string(),
            GatewayError::Network { .. } => "network_error".to_string(),
            GatewayError::RequiresAction { .. } => "authentication_required".to_string(),
            GatewayError::InvalidRequest(_) => "invalid_request".to_string(),
        }
    }

    /// Provider payment created before the failure, if any
    pub fn payment_id(&self) -> Option<&str> {
        match self {
            GatewayError::Provider { payment_id, .. } => payment_id.as_deref(),
            GatewayError::RequiresAction { payment_id } => Some(payment_id),
            _ => None,
        }
    }

    /// Status to record on the attempt when this error ends the flow
    pub fn attempt_status(&self) -> PaymentStatus {
        match self {
            GatewayError::RequiresAction { .. } => PaymentStatus::RequiresAction,
            _ => PaymentStatus::Failed,
        }
    }
}

/// External payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name stored on attempts, e.g. "Stripe"
    fn provider(&self) -> &str;

    /// Synchronous off-session charge. `request.attempt_id` is the idempotency key.
    async fn charge_attempt(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError>;

    /// Current state of a payment at the provider
    async fn get_payment_status(&self, provider_payment_id: &str) -> Result<PaymentStatus, GatewayError>;
}
