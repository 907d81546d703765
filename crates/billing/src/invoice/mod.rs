//! Invoices: generation from the ledger and the DRAFT -> FINALIZED -> PAID lifecycle

mod finalizer;
mod generator;

pub use finalizer::InvoiceFinalizer;
pub use generator::InvoiceGenerator;

use meterbook_shared::{BillingPeriod, UsageType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;

/// Invoice lifecycle. Transitions only move forward; VOID is set administratively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Finalized => "FINALIZED",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Void => "VOID",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(InvoiceStatus::Draft),
            "FINALIZED" => Ok(InvoiceStatus::Finalized),
            "PAID" => Ok(InvoiceStatus::Paid),
            "VOID" => Ok(InvoiceStatus::Void),
            other => Err(BillingError::Internal(format!("unknown invoice status {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceLine {
    pub id: Uuid,
    pub usage_type: Option<UsageType>,
    pub quantity: i64,
    /// 0 when entries for this usage type were booked at more than one rate
    pub unit_price_cents: i64,
    pub line_total_cents: i64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub period: BillingPeriod,
    pub total_cents: i64,
    pub currency: String,
    pub status: InvoiceStatus,
    pub lines: Vec<InvoiceLine>,
    /// Provider transaction that settled the invoice, set when PAID
    pub payment_reference: Option<String>,
    pub created_at: OffsetDateTime,
}
