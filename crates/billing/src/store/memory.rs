//! In-memory store implementations
//!
//! Same contracts as the Postgres stores (idempotency keys, conditional
//! updates, uniqueness) backed by process memory. Use for tests and local
//! development; nothing here survives a restart.

use async_trait::async_trait;
use meterbook_shared::{BillingPeriod, UsageType};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AccountProvider, CasOutcome, FlushOutcome, InvoiceStore, LedgerStore, LedgerWrite,
    PaymentAttemptStore, PricingStore, UsageStore,
};
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::ledger::LedgerEntry;
use crate::payment::models::{AttemptUpdate, BillingAccount, PaymentAttempt, PaymentStatus};
use crate::pricing::PriceRule;
use crate::usage::{FlushBatch, UsageRecord};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Usage
// =============================================================================

#[derive(Default)]
struct UsageState {
    applied_batches: HashSet<Uuid>,
    totals: HashMap<(Uuid, UsageType, BillingPeriod), i64>,
}

#[derive(Default)]
pub struct InMemoryUsageStore {
    state: Mutex<UsageState>,
}

impl InMemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for InMemoryUsageStore {
    async fn flush(&self, batch: &FlushBatch) -> BillingResult<FlushOutcome> {
        let mut state = lock(&self.state);
        if !state.applied_batches.insert(batch.batch_id) {
            return Ok(FlushOutcome::Duplicate);
        }
        for record in &batch.records {
            let total = state
                .totals
                .entry((record.tenant_id, record.usage_type, record.period))
                .or_default();
            *total = total.saturating_add(record.total_quantity);
        }
        Ok(FlushOutcome::Applied)
    }

    async fn get_usage_for_period(&self, period: BillingPeriod) -> BillingResult<Vec<UsageRecord>> {
        let state = lock(&self.state);
        let mut records: Vec<UsageRecord> = state
            .totals
            .iter()
            .filter(|((_, _, p), _)| *p == period)
            .map(|(&(tenant_id, usage_type, period), &total_quantity)| UsageRecord {
                tenant_id,
                usage_type,
                total_quantity,
                period,
            })
            .collect();
        records.sort_by_key(|r| (r.tenant_id, r.usage_type));
        Ok(records)
    }
}

// =============================================================================
// Pricing
// =============================================================================

#[derive(Default)]
pub struct InMemoryPricingStore {
    rules: Mutex<Vec<PriceRule>>,
}

impl InMemoryPricingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&self, rule: PriceRule) {
        lock(&self.rules).push(rule);
    }
}

#[async_trait]
impl PricingStore for InMemoryPricingStore {
    async fn get_price_rule(
        &self,
        usage_type: UsageType,
        tenant_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<PriceRule>> {
        let rules = lock(&self.rules);
        let candidates = rules
            .iter()
            .filter(|r| r.usage_type == usage_type && r.applies_at(at));

        // tenant override first, then newest effective_from
        let best = candidates
            .filter(|r| r.tenant_id.is_none() || r.tenant_id == Some(tenant_id))
            .max_by_key(|r| (r.tenant_id.is_some(), r.effective_from));
        Ok(best.cloned())
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Default)]
pub struct InMemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, in insertion order
    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerWrite> {
        let mut entries = lock(&self.entries);
        let exists = entries
            .iter()
            .any(|e| e.tenant_id == entry.tenant_id && e.entry_id == entry.entry_id);
        if exists {
            return Ok(LedgerWrite::Duplicate);
        }
        entries.push(entry.clone());
        Ok(LedgerWrite::Inserted)
    }

    async fn get_entries_for_period(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Vec<LedgerEntry>> {
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.period == period)
            .cloned()
            .collect())
    }
}

// =============================================================================
// Invoices
// =============================================================================

#[derive(Default)]
pub struct InMemoryInvoiceStore {
    invoices: Mutex<HashMap<Uuid, Invoice>>,
}

impl InMemoryInvoiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administrative status override (e.g. voiding)
    pub fn set_status(&self, invoice_id: Uuid, status: InvoiceStatus) -> BillingResult<()> {
        let mut invoices = lock(&self.invoices);
        let invoice = invoices
            .get_mut(&invoice_id)
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;
        invoice.status = status;
        Ok(())
    }

    fn transition(
        &self,
        invoice_id: Uuid,
        from: InvoiceStatus,
        to: InvoiceStatus,
        payment_reference: Option<&str>,
    ) -> CasOutcome {
        let mut invoices = lock(&self.invoices);
        match invoices.get_mut(&invoice_id) {
            Some(invoice) if invoice.status == from => {
                invoice.status = to;
                if let Some(reference) = payment_reference {
                    invoice.payment_reference = Some(reference.to_string());
                }
                CasOutcome::Applied
            }
            _ => CasOutcome::Unchanged,
        }
    }
}

#[async_trait]
impl InvoiceStore for InMemoryInvoiceStore {
    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut invoices = lock(&self.invoices);
        let clash = invoices
            .values()
            .any(|i| i.tenant_id == invoice.tenant_id && i.period == invoice.period);
        if clash || invoices.contains_key(&invoice.id) {
            return Err(BillingError::Database(format!(
                "invoice for tenant {} period {} already exists",
                invoice.tenant_id, invoice.period
            )));
        }
        invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Option<Invoice>> {
        Ok(lock(&self.invoices)
            .values()
            .find(|i| i.tenant_id == tenant_id && i.period == period)
            .cloned())
    }

    async fn get_invoice_by_id(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        Ok(lock(&self.invoices).get(&invoice_id).cloned())
    }

    async fn delete_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome> {
        let mut invoices = lock(&self.invoices);
        match invoices.get(&invoice_id) {
            Some(invoice) if invoice.status == InvoiceStatus::Draft => {
                invoices.remove(&invoice_id);
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Unchanged),
        }
    }

    async fn replace_draft_invoice(
        &self,
        draft_id: Uuid,
        replacement: &Invoice,
    ) -> BillingResult<CasOutcome> {
        let mut invoices = lock(&self.invoices);
        match invoices.get(&draft_id) {
            Some(invoice) if invoice.status == InvoiceStatus::Draft => {
                invoices.remove(&draft_id);
                invoices.insert(replacement.id, replacement.clone());
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Unchanged),
        }
    }

    async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome> {
        Ok(self.transition(
            invoice_id,
            InvoiceStatus::Draft,
            InvoiceStatus::Finalized,
            None,
        ))
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        payment_reference: &str,
    ) -> BillingResult<CasOutcome> {
        Ok(self.transition(
            invoice_id,
            InvoiceStatus::Finalized,
            InvoiceStatus::Paid,
            Some(payment_reference),
        ))
    }
}

// =============================================================================
// Payment attempts
// =============================================================================

#[derive(Default)]
pub struct InMemoryPaymentAttemptStore {
    attempts: Mutex<HashMap<Uuid, PaymentAttempt>>,
}

impl InMemoryPaymentAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts_for_invoice(&self, invoice_id: Uuid) -> Vec<PaymentAttempt> {
        lock(&self.attempts)
            .values()
            .filter(|a| a.invoice_id == invoice_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PaymentAttemptStore for InMemoryPaymentAttemptStore {
    async fn create_payment_attempt(&self, attempt: &PaymentAttempt) -> BillingResult<()> {
        let mut attempts = lock(&self.attempts);
        if attempts.contains_key(&attempt.id) {
            return Err(BillingError::Database(format!(
                "payment attempt {} already exists",
                attempt.id
            )));
        }
        attempts.insert(attempt.id, attempt.clone());
        Ok(())
    }

    async fn update_attempt_status(
        &self,
        attempt_id: Uuid,
        update: &AttemptUpdate,
    ) -> BillingResult<CasOutcome> {
        let mut attempts = lock(&self.attempts);
        match attempts.get_mut(&attempt_id) {
            Some(attempt) if attempt.status == PaymentStatus::Pending => {
                attempt.status = update.status;
                if update.provider_payment_id.is_some() {
                    attempt.provider_payment_id = update.provider_payment_id.clone();
                }
                attempt.error_code = update.error_code.clone();
                attempt.error_message = update.error_message.clone();
                attempt.updated_at = OffsetDateTime::now_utc();
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Unchanged),
        }
    }

    async fn get_pending_attempts(
        &self,
        limit: i64,
        older_than: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentAttempt>> {
        let mut pending: Vec<PaymentAttempt> = lock(&self.attempts)
            .values()
            .filter(|a| a.status == PaymentStatus::Pending && a.created_at < older_than)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn get_attempt_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<PaymentAttempt>> {
        Ok(lock(&self.attempts)
            .values()
            .find(|a| a.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> BillingResult<Option<PaymentAttempt>> {
        Ok(lock(&self.attempts).get(&attempt_id).cloned())
    }
}

// =============================================================================
// Accounts
// =============================================================================

#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Mutex<HashMap<Uuid, BillingAccount>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: Uuid, account: BillingAccount) {
        lock(&self.accounts).insert(tenant_id, account);
    }
}

#[async_trait]
impl AccountProvider for InMemoryAccountStore {
    async fn get_billing_account_details(&self, tenant_id: Uuid) -> BillingResult<BillingAccount> {
        lock(&self.accounts)
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("billing account for tenant {tenant_id}")))
    }
}
