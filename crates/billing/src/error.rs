//! Billing error types

use meterbook_shared::{DomainError, UsageType};
use thiserror::Error;
use uuid::Uuid;

use crate::invoice::InvoiceStatus;
use crate::payment::gateway::GatewayError;

/// Billing-specific errors
///
/// Every payload is owned so a single outcome can be handed to all callers
/// waiting on a coalesced payment flow.
#[derive(Debug, Clone, Error)]
pub enum BillingError {
    // Configuration: abort the run
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No price rule for usage type {usage_type} (tenant {tenant_id})")]
    PriceRuleNotFound {
        tenant_id: Uuid,
        usage_type: UsageType,
    },

    #[error("Invalid pricing tiers: {0}")]
    InvalidTiers(String),

    // Integrity: reject the operation, nothing written
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Usage cannot be negative: {0}")]
    NegativeUsage(i64),

    // Invoice / payment state machine
    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Invoice is already finalized")]
    InvoiceAlreadyFinalized,

    #[error("Invoice is not a draft (status: {status})")]
    InvoiceNotDraft { status: InvoiceStatus },

    #[error("Invoice cannot be paid in status {status}")]
    InvoiceNotPayable { status: InvoiceStatus },

    // Payments
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Payment attempt {attempt_id} failed: {reason}")]
    PaymentFailed { attempt_id: Uuid, reason: String },

    #[error("CRITICAL: payment {transaction_id} captured for invoice {invoice_id} but not recorded: {reason}")]
    PaymentNotRecorded {
        invoice_id: Uuid,
        transaction_id: String,
        reason: String,
    },

    // Infrastructure
    #[error("Database error: {0}")]
    Database(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl BillingError {
    /// Errors meaning the requested transition already happened
    pub fn is_already_done(&self) -> bool {
        matches!(self, BillingError::InvoiceAlreadyFinalized)
    }

    /// Errors worth retrying later without operator intervention
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Gateway(err) => crate::payment::retry::RetryPolicy::is_retryable(err),
            BillingError::Timeout(_) | BillingError::Database(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<DomainError> for BillingError {
    fn from(err: DomainError) -> Self {
        BillingError::InvalidInput(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("serialization: {err}"))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
