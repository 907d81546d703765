use meterbook_shared::{BillingPeriod, TransactionType, UsageType};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Invoice, InvoiceLine, InvoiceStatus};
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerEntry;
use crate::store::{InvoiceStore, LedgerStore};

/// Builds DRAFT invoices from the ledger
pub struct InvoiceGenerator {
    ledger: Arc<dyn LedgerStore>,
    invoices: Arc<dyn InvoiceStore>,
}

#[derive(Default)]
struct LineTotals {
    amount_cents: i64,
    quantity: i64,
    unit_prices: BTreeSet<i64>,
}

impl InvoiceGenerator {
    pub fn new(ledger: Arc<dyn LedgerStore>, invoices: Arc<dyn InvoiceStore>) -> Self {
        Self { ledger, invoices }
    }

    /// Create (or rebuild) the DRAFT invoice for a tenant's period.
    ///
    /// The replacement is built and validated before anything is written; an
    /// existing DRAFT is then swapped for it atomically. Anything past DRAFT is
    /// immutable and makes this fail. Returns `None` when the period has no
    /// billable ledger entries.
    pub async fn generate_invoice_for_tenant(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Option<Invoice>> {
        let existing = match self.invoices.get_invoice(tenant_id, period).await? {
            Some(invoice) if invoice.status != InvoiceStatus::Draft => {
                return Err(not_regenerable(invoice.status));
            }
            other => other,
        };

        let built = self.build_invoice(tenant_id, period).await?;

        match (existing, built) {
            (None, None) => {
                tracing::debug!(tenant_id = %tenant_id, period = %period, "No ledger entries, no invoice");
                Ok(None)
            }
            (Some(draft), None) => {
                if self.invoices.delete_invoice(draft.id).await?.applied() {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        invoice_id = %draft.id,
                        "Ledger is empty, dropped stale draft"
                    );
                    Ok(None)
                } else {
                    Err(self.lost_race(draft.id).await?)
                }
            }
            (None, Some(invoice)) => {
                self.invoices.create_invoice(&invoice).await?;
                log_generated(&invoice);
                Ok(Some(invoice))
            }
            (Some(draft), Some(invoice)) => {
                if !self
                    .invoices
                    .replace_draft_invoice(draft.id, &invoice)
                    .await?
                    .applied()
                {
                    return Err(self.lost_race(draft.id).await?);
                }
                tracing::debug!(
                    tenant_id = %tenant_id,
                    replaced = %draft.id,
                    invoice_id = %invoice.id,
                    "Rebuilt draft invoice"
                );
                log_generated(&invoice);
                Ok(Some(invoice))
            }
        }
    }

    /// Group the period's ledger into invoice lines without writing anything
    async fn build_invoice(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Option<Invoice>> {
        let entries: Vec<LedgerEntry> = self
            .ledger
            .get_entries_for_period(tenant_id, period)
            .await?
            .into_iter()
            .filter(|e| e.transaction_type != TransactionType::Payment)
            .collect();

        let Some(first) = entries.first() else {
            return Ok(None);
        };
        let currency = first.currency.clone();

        let mut groups: BTreeMap<Option<UsageType>, LineTotals> = BTreeMap::new();
        for entry in &entries {
            if entry.currency != currency {
                return Err(BillingError::CurrencyMismatch {
                    expected: currency,
                    found: entry.currency.clone(),
                });
            }
            let totals = groups.entry(entry.usage_type).or_default();
            totals.amount_cents += entry.invoice_amount();
            totals.quantity += entry.invoice_quantity();
            totals.unit_prices.insert(entry.unit_price_cents);
        }

        let total_cents: i64 = groups.values().map(|t| t.amount_cents).sum();
        let lines: Vec<InvoiceLine> = groups
            .into_iter()
            .filter(|(_, totals)| totals.amount_cents != 0)
            .map(|(usage_type, totals)| {
                let unit_price_cents = match totals.unit_prices.len() {
                    1 => totals.unit_prices.first().copied().unwrap_or(0),
                    _ => 0,
                };
                InvoiceLine {
                    id: Uuid::new_v4(),
                    usage_type,
                    quantity: totals.quantity,
                    unit_price_cents,
                    line_total_cents: totals.amount_cents,
                    description: match usage_type {
                        Some(usage_type) => format!("{usage_type} Charges"),
                        None => "Adjustments".to_string(),
                    },
                }
            })
            .collect();

        Ok(Some(Invoice {
            id: Uuid::new_v4(),
            tenant_id,
            period,
            total_cents,
            currency,
            status: InvoiceStatus::Draft,
            lines,
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        }))
    }

    /// The draft moved past DRAFT between our read and the write
    async fn lost_race(&self, draft_id: Uuid) -> BillingResult<BillingError> {
        let status = self
            .invoices
            .get_invoice_by_id(draft_id)
            .await?
            .map_or(InvoiceStatus::Finalized, |i| i.status);
        Ok(not_regenerable(status))
    }
}

fn log_generated(invoice: &Invoice) {
    tracing::info!(
        tenant_id = %invoice.tenant_id,
        invoice_id = %invoice.id,
        period = %invoice.period,
        total_cents = invoice.total_cents,
        lines = invoice.lines.len(),
        "Generated draft invoice"
    );
}

fn not_regenerable(status: InvoiceStatus) -> BillingError {
    match status {
        InvoiceStatus::Finalized => BillingError::InvoiceAlreadyFinalized,
        status => BillingError::InvoiceNotDraft { status },
    }
}
