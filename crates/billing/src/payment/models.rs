//! Payment attempt records and gateway request/response types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Reference stored on invoices settled without a gateway call
pub const ZERO_AMOUNT_REFERENCE: &str = "system-zero-amount";

/// Payment attempt lifecycle. Created PENDING, moves once to a final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    RequiresAction,
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::RequiresAction => "REQUIRES_ACTION",
            PaymentStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REQUIRES_ACTION" => Ok(PaymentStatus::RequiresAction),
            "UNKNOWN" => Ok(PaymentStatus::Unknown),
            other => Err(BillingError::Internal(format!("unknown payment status {other}"))),
        }
    }
}

/// Write-ahead record of one try at charging an invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAttempt {
    /// Doubles as the gateway idempotency key
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub status: PaymentStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PaymentAttempt {
    pub fn pending(
        invoice_id: Uuid,
        tenant_id: Uuid,
        provider: impl Into<String>,
        amount_cents: i64,
        currency: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4(),
            invoice_id,
            tenant_id,
            provider: provider.into(),
            provider_payment_id: None,
            status: PaymentStatus::Pending,
            amount_cents,
            currency: currency.into(),
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Conditional status change applied to a PENDING attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptUpdate {
    pub status: PaymentStatus,
    /// Left untouched when `None`
    pub provider_payment_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl AttemptUpdate {
    pub fn succeeded(provider_payment_id: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Succeeded,
            provider_payment_id: Some(provider_payment_id.into()),
            error_code: None,
            error_message: None,
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: PaymentStatus::Failed,
            provider_payment_id: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }

    pub fn with_provider_id(mut self, provider_payment_id: Option<String>) -> Self {
        if provider_payment_id.is_some() {
            self.provider_payment_id = provider_payment_id;
        }
        self
    }
}

/// Off-session charge sent to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    /// Idempotency key: one per attempt, reused across retries of that attempt
    pub attempt_id: Uuid,
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_id: String,
    pub payment_method_id: String,
    pub description: String,
}

impl PaymentRequest {
    pub fn metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            ("tenant_id".to_string(), self.tenant_id.to_string()),
            ("invoice_id".to_string(), self.invoice_id.to_string()),
            ("attempt_id".to_string(), self.attempt_id.to_string()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentResult {
    pub provider_payment_id: String,
    pub status: PaymentStatus,
}

/// Who and how to charge for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingAccount {
    pub customer_id: String,
    pub payment_method_id: String,
    pub email: String,
}

/// Result of a `pay_invoice` call, shared by every coalesced caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// The invoice was already PAID before this flow ran
    AlreadyPaid,
    Paid { reference: String },
    /// The gateway accepted the charge but has not settled it yet
    Processing {
        attempt_id: Uuid,
        provider_payment_id: String,
    },
}
