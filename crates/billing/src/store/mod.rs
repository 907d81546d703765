//! Persistence contracts consumed by the billing pipeline
//!
//! Conditional writes return a [`CasOutcome`] so that "the precondition did not
//! hold" is a normal result, distinct from an infrastructure error.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use meterbook_shared::{BillingPeriod, UsageType};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::invoice::Invoice;
use crate::ledger::LedgerEntry;
use crate::payment::models::{AttemptUpdate, BillingAccount, PaymentAttempt};
use crate::pricing::PriceRule;
use crate::usage::{FlushBatch, UsageRecord};

/// Result of a compare-and-swap style write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied,
    /// The row was not in the expected state; nothing changed
    Unchanged,
}

impl CasOutcome {
    pub fn applied(self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Applied,
    /// The batch id was seen before; no deltas were added
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerWrite {
    Inserted,
    /// An entry with the same `(tenant_id, entry_id)` already exists
    Duplicate,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Add the batch's deltas to the stored aggregates, at most once per batch id
    async fn flush(&self, batch: &FlushBatch) -> BillingResult<FlushOutcome>;

    async fn get_usage_for_period(&self, period: BillingPeriod) -> BillingResult<Vec<UsageRecord>>;
}

#[async_trait]
pub trait PricingStore: Send + Sync {
    /// The rule in force at `at`; a tenant-specific rule wins over the default
    async fn get_price_rule(
        &self,
        usage_type: UsageType,
        tenant_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<PriceRule>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerWrite>;

    async fn get_entries_for_period(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait InvoiceStore: Send + Sync {
    /// Insert header and lines together
    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()>;

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Option<Invoice>>;

    async fn get_invoice_by_id(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Delete a DRAFT invoice and its lines
    async fn delete_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome>;

    /// Delete the DRAFT `draft_id` and insert `replacement` in one step.
    /// `Unchanged` (and nothing written) when the draft is no longer DRAFT.
    async fn replace_draft_invoice(
        &self,
        draft_id: Uuid,
        replacement: &Invoice,
    ) -> BillingResult<CasOutcome>;

    /// DRAFT -> FINALIZED
    async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome>;

    /// FINALIZED -> PAID, recording the settling transaction
    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        payment_reference: &str,
    ) -> BillingResult<CasOutcome>;
}

#[async_trait]
pub trait PaymentAttemptStore: Send + Sync {
    async fn create_payment_attempt(&self, attempt: &PaymentAttempt) -> BillingResult<()>;

    /// Apply `update` only if the attempt is still PENDING
    async fn update_attempt_status(
        &self,
        attempt_id: Uuid,
        update: &AttemptUpdate,
    ) -> BillingResult<CasOutcome>;

    /// PENDING attempts created before `older_than`, oldest first
    async fn get_pending_attempts(
        &self,
        limit: i64,
        older_than: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentAttempt>>;

    async fn get_attempt_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<PaymentAttempt>>;

    async fn get_attempt(&self, attempt_id: Uuid) -> BillingResult<Option<PaymentAttempt>>;
}

#[async_trait]
pub trait AccountProvider: Send + Sync {
    async fn get_billing_account_details(&self, tenant_id: Uuid) -> BillingResult<BillingAccount>;
}
