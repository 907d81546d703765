//! Append-only ledger of monetary movements
//!
//! Entries are never updated. Each carries a deterministic `entry_id` so any
//! job that books it can be re-run: the store ignores a second insert with the
//! same `(tenant_id, entry_id)`.

use meterbook_shared::{BillingPeriod, TransactionType, UsageType};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub tenant_id: Uuid,
    pub transaction_type: TransactionType,
    /// Always non-negative; direction comes from `transaction_type`
    pub amount_cents: i64,
    pub currency: String,
    /// `None` for movements not tied to metered usage (payments, manual adjustments)
    pub usage_type: Option<UsageType>,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub description: String,
    pub period: BillingPeriod,
    pub created_at: OffsetDateTime,
}

impl LedgerEntry {
    /// Contribution to an invoice total: DEBIT adds, CREDIT subtracts,
    /// PAYMENT settles an invoice and is not part of one.
    pub fn invoice_amount(&self) -> i64 {
        match self.transaction_type {
            TransactionType::Debit => self.amount_cents,
            TransactionType::Credit => -self.amount_cents,
            TransactionType::Payment => 0,
        }
    }

    pub fn invoice_quantity(&self) -> i64 {
        match self.transaction_type {
            TransactionType::Debit => self.quantity,
            TransactionType::Credit => -self.quantity,
            TransactionType::Payment => 0,
        }
    }
}

/// Entry id for a usage charge, e.g. `usage_<tenant>_2024_06_API_REQUEST`
pub fn usage_entry_id(tenant_id: Uuid, period: BillingPeriod, usage_type: UsageType) -> String {
    format!(
        "usage_{}_{}_{:02}_{}",
        tenant_id,
        period.year(),
        period.month(),
        usage_type
    )
}

/// Entry id for the payment settling an invoice
pub fn payment_entry_id(invoice_id: Uuid) -> String {
    format!("payment_{invoice_id}")
}
