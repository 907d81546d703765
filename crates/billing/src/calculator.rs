//! Periodic billing job: priced usage into ledger debits
//!
//! Re-running a period is a no-op because every debit has a deterministic
//! entry id. A missing price rule is a configuration defect and aborts the run
//! before anything is written.

use meterbook_shared::{normalize_currency, BillingPeriod, TransactionType};
use std::collections::BTreeSet;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{usage_entry_id, LedgerEntry};
use crate::pricing::{PriceRule, PricingEngine};
use crate::store::{LedgerStore, LedgerWrite, PricingStore, UsageStore};
use crate::usage::UsageRecord;

/// What one `bill_period` run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BillingRunSummary {
    pub records: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped_zero_cost: usize,
    /// Tenants with any usage in the period
    pub tenants: BTreeSet<Uuid>,
}

pub struct BillingCalculator {
    usage: Arc<dyn UsageStore>,
    pricing: Arc<dyn PricingStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl BillingCalculator {
    pub fn new(
        usage: Arc<dyn UsageStore>,
        pricing: Arc<dyn PricingStore>,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            usage,
            pricing,
            ledger,
        }
    }

    /// Price every usage record of `period` and book the debits
    pub async fn bill_period(&self, period: BillingPeriod) -> BillingResult<BillingRunSummary> {
        let records = self.usage.get_usage_for_period(period).await?;
        let bill_time = period.start()?;

        tracing::info!(period = %period, records = records.len(), "Starting billing run");

        let mut summary = BillingRunSummary {
            records: records.len(),
            ..Default::default()
        };

        // price everything first so a missing rule leaves the ledger untouched
        let mut entries = Vec::with_capacity(records.len());
        for record in &records {
            summary.tenants.insert(record.tenant_id);

            let rule = self
                .pricing
                .get_price_rule(record.usage_type, record.tenant_id, bill_time)
                .await?
                .ok_or(BillingError::PriceRuleNotFound {
                    tenant_id: record.tenant_id,
                    usage_type: record.usage_type,
                })?;

            match price_record(record, &rule, period)? {
                Some(entry) => entries.push(entry),
                None => summary.skipped_zero_cost += 1,
            }
        }

        for entry in &entries {
            match self.ledger.create_ledger_entry(entry).await? {
                LedgerWrite::Inserted => summary.inserted += 1,
                LedgerWrite::Duplicate => {
                    tracing::debug!(entry_id = %entry.entry_id, "Ledger entry already booked");
                    summary.duplicates += 1;
                }
            }
        }

        tracing::info!(
            period = %period,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            skipped = summary.skipped_zero_cost,
            "Billing run complete"
        );
        Ok(summary)
    }
}

/// Ledger debit for one usage record, or `None` when it costs nothing
fn price_record(
    record: &UsageRecord,
    rule: &PriceRule,
    period: BillingPeriod,
) -> BillingResult<Option<LedgerEntry>> {
    if record.total_quantity < 0 {
        return Err(BillingError::NegativeUsage(record.total_quantity));
    }
    let currency = normalize_currency(&rule.currency)?;

    let (amount_cents, unit_price_cents, rate) = match &rule.tiers {
        Some(tiers) => {
            let engine = PricingEngine::new(tiers.clone())?;
            let cost = engine.calculate_cost(record.total_quantity)?;
            (cost, 0, "tiered".to_string())
        }
        None => {
            let cost = record
                .total_quantity
                .checked_mul(rule.unit_price_cents)
                .ok_or_else(|| BillingError::Integrity("usage cost overflows i64".into()))?;
            (
                cost,
                rule.unit_price_cents,
                format!("{} cents/unit", rule.unit_price_cents),
            )
        }
    };

    if amount_cents == 0 {
        return Ok(None);
    }
    if amount_cents < 0 {
        return Err(BillingError::Integrity(format!(
            "negative charge {amount_cents} for tenant {}",
            record.tenant_id
        )));
    }

    Ok(Some(LedgerEntry {
        entry_id: usage_entry_id(record.tenant_id, period, record.usage_type),
        tenant_id: record.tenant_id,
        transaction_type: TransactionType::Debit,
        amount_cents,
        description: format!(
            "{} Fee: {} units @ {} {}",
            record.usage_type, record.total_quantity, currency, rate
        ),
        currency,
        usage_type: Some(record.usage_type),
        quantity: record.total_quantity,
        unit_price_cents,
        period,
        created_at: OffsetDateTime::now_utc(),
    }))
}
