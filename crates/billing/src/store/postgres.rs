//! Postgres store implementations
//!
//! Schema lives in `migrations/`. Conditional transitions are single
//! `UPDATE ... WHERE status = ...` statements; zero affected rows maps to
//! [`CasOutcome::Unchanged`].

use async_trait::async_trait;
use meterbook_shared::{BillingPeriod, UsageType};
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AccountProvider, CasOutcome, FlushOutcome, InvoiceStore, LedgerStore, LedgerWrite,
    PaymentAttemptStore, PricingStore, UsageStore,
};
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceLine};
use crate::ledger::LedgerEntry;
use crate::payment::models::{AttemptUpdate, BillingAccount, PaymentAttempt};
use crate::pricing::{PriceRule, Tier};
use crate::usage::{FlushBatch, UsageRecord};

fn period_from_row(year: i32, month: i16) -> BillingResult<BillingPeriod> {
    let month = u8::try_from(month)
        .map_err(|_| BillingError::Database(format!("invalid billing month {month}")))?;
    Ok(BillingPeriod::new(year, month)?)
}

fn cas(rows_affected: u64) -> CasOutcome {
    if rows_affected > 0 {
        CasOutcome::Applied
    } else {
        CasOutcome::Unchanged
    }
}

fn parse_usage_type(raw: Option<String>) -> BillingResult<Option<UsageType>> {
    Ok(raw.as_deref().map(str::parse).transpose()?)
}

// =============================================================================
// Usage
// =============================================================================

pub struct PgUsageStore {
    pool: PgPool,
}

impl PgUsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn flush(&self, batch: &FlushBatch) -> BillingResult<FlushOutcome> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "INSERT INTO usage_flush_history (batch_id) VALUES ($1) ON CONFLICT (batch_id) DO NOTHING",
        )
        .bind(batch.batch_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            tracing::warn!(batch_id = %batch.batch_id, "Flush batch already applied");
            return Ok(FlushOutcome::Duplicate);
        }

        for record in &batch.records {
            sqlx::query(
                r#"
                INSERT INTO usage_aggregates (tenant_id, usage_type, billing_year, billing_month, total_quantity)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (tenant_id, usage_type, billing_year, billing_month)
                DO UPDATE SET total_quantity = usage_aggregates.total_quantity + EXCLUDED.total_quantity,
                              updated_at = NOW()
                "#,
            )
            .bind(record.tenant_id)
            .bind(record.usage_type.as_str())
            .bind(record.period.year())
            .bind(i16::from(record.period.month()))
            .bind(record.total_quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(FlushOutcome::Applied)
    }

    async fn get_usage_for_period(&self, period: BillingPeriod) -> BillingResult<Vec<UsageRecord>> {
        let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
            r#"
            SELECT tenant_id, usage_type, total_quantity
            FROM usage_aggregates
            WHERE billing_year = $1 AND billing_month = $2
            ORDER BY tenant_id, usage_type
            "#,
        )
        .bind(period.year())
        .bind(i16::from(period.month()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(tenant_id, usage_type, total_quantity)| -> BillingResult<UsageRecord> {
                Ok(UsageRecord {
                    tenant_id,
                    usage_type: usage_type.parse()?,
                    total_quantity,
                    period,
                })
            })
            .collect()
    }
}

// =============================================================================
// Pricing
// =============================================================================

pub struct PgPricingStore {
    pool: PgPool,
}

impl PgPricingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PriceRuleRow {
    id: Uuid,
    tenant_id: Option<Uuid>,
    usage_type: String,
    unit_price_cents: i64,
    currency: String,
    tiers: Option<Json<Vec<Tier>>>,
    effective_from: OffsetDateTime,
    effective_to: Option<OffsetDateTime>,
}

#[async_trait]
impl PricingStore for PgPricingStore {
    async fn get_price_rule(
        &self,
        usage_type: UsageType,
        tenant_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<PriceRule>> {
        let row: Option<PriceRuleRow> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, usage_type, unit_price_cents, currency, tiers, effective_from, effective_to
            FROM pricing_rules
            WHERE usage_type = $1
              AND (tenant_id = $2 OR tenant_id IS NULL)
              AND effective_from <= $3
              AND (effective_to IS NULL OR effective_to > $3)
            ORDER BY tenant_id NULLS LAST, effective_from DESC
            LIMIT 1
            "#,
        )
        .bind(usage_type.as_str())
        .bind(tenant_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> BillingResult<PriceRule> {
            Ok(PriceRule {
                id: r.id,
                tenant_id: r.tenant_id,
                usage_type: r.usage_type.parse()?,
                unit_price_cents: r.unit_price_cents,
                currency: r.currency.trim().to_string(),
                tiers: r.tiers.map(|Json(tiers)| tiers),
                effective_from: r.effective_from,
                effective_to: r.effective_to,
            })
        })
        .transpose()
    }
}

// =============================================================================
// Ledger
// =============================================================================

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    entry_id: String,
    tenant_id: Uuid,
    transaction_type: String,
    amount_cents: i64,
    currency: String,
    usage_type: Option<String>,
    quantity: i64,
    unit_price_cents: i64,
    description: String,
    billing_year: i32,
    billing_month: i16,
    created_at: OffsetDateTime,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = BillingError;

    fn try_from(row: LedgerRow) -> BillingResult<Self> {
        Ok(LedgerEntry {
            entry_id: row.entry_id,
            tenant_id: row.tenant_id,
            transaction_type: row.transaction_type.parse()?,
            amount_cents: row.amount_cents,
            currency: row.currency.trim().to_string(),
            usage_type: parse_usage_type(row.usage_type)?,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            description: row.description,
            period: period_from_row(row.billing_year, row.billing_month)?,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_ledger_entry(&self, entry: &LedgerEntry) -> BillingResult<LedgerWrite> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_ledger
                (tenant_id, entry_id, transaction_type, amount_cents, currency, usage_type,
                 quantity, unit_price_cents, description, billing_year, billing_month, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (tenant_id, entry_id) DO NOTHING
            "#,
        )
        .bind(entry.tenant_id)
        .bind(&entry.entry_id)
        .bind(entry.transaction_type.as_str())
        .bind(entry.amount_cents)
        .bind(&entry.currency)
        .bind(entry.usage_type.map(|t| t.as_str()))
        .bind(entry.quantity)
        .bind(entry.unit_price_cents)
        .bind(&entry.description)
        .bind(entry.period.year())
        .bind(i16::from(entry.period.month()))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(entry_id = %entry.entry_id, "Ledger entry already exists");
            Ok(LedgerWrite::Duplicate)
        } else {
            Ok(LedgerWrite::Inserted)
        }
    }

    async fn get_entries_for_period(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT entry_id, tenant_id, transaction_type, amount_cents, currency, usage_type,
                   quantity, unit_price_cents, description, billing_year, billing_month, created_at
            FROM billing_ledger
            WHERE tenant_id = $1 AND billing_year = $2 AND billing_month = $3
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(period.year())
        .bind(i16::from(period.month()))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerEntry::try_from).collect()
    }
}

// =============================================================================
// Invoices
// =============================================================================

pub struct PgInvoiceStore {
    pool: PgPool,
}

impl PgInvoiceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_lines(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceLine>> {
        let rows: Vec<(Uuid, Option<String>, i64, i64, i64, String)> = sqlx::query_as(
            r#"
            SELECT id, usage_type, quantity, unit_price_cents, line_total_cents, description
            FROM invoice_lines
            WHERE invoice_id = $1
            ORDER BY usage_type NULLS LAST
            "#,
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, usage_type, quantity, unit_price_cents, line_total_cents, description)|
                 -> BillingResult<InvoiceLine> {
                    Ok(InvoiceLine {
                        id,
                        usage_type: parse_usage_type(usage_type)?,
                        quantity,
                        unit_price_cents,
                        line_total_cents,
                        description,
                    })
                },
            )
            .collect()
    }

    async fn hydrate(&self, row: Option<InvoiceRow>) -> BillingResult<Option<Invoice>> {
        let Some(row) = row else {
            return Ok(None);
        };
        let lines = self.load_lines(row.invoice_id).await?;
        Ok(Some(Invoice {
            id: row.invoice_id,
            tenant_id: row.tenant_id,
            period: period_from_row(row.billing_year, row.billing_month)?,
            total_cents: row.total_amount_cents,
            currency: row.currency.trim().to_string(),
            status: row.status.parse()?,
            lines,
            payment_reference: row.payment_reference,
            created_at: row.created_at,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    invoice_id: Uuid,
    tenant_id: Uuid,
    billing_year: i32,
    billing_month: i16,
    total_amount_cents: i64,
    currency: String,
    status: String,
    payment_reference: Option<String>,
    created_at: OffsetDateTime,
}

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, billing_year, billing_month, \
     total_amount_cents, currency, status, payment_reference, created_at";

async fn insert_invoice(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    invoice: &Invoice,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        INSERT INTO invoices
            (invoice_id, tenant_id, billing_year, billing_month, total_amount_cents, currency, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(invoice.id)
    .bind(invoice.tenant_id)
    .bind(invoice.period.year())
    .bind(i16::from(invoice.period.month()))
    .bind(invoice.total_cents)
    .bind(&invoice.currency)
    .bind(invoice.status.as_str())
    .bind(invoice.created_at)
    .execute(&mut **tx)
    .await?;

    for line in &invoice.lines {
        sqlx::query(
            r#"
            INSERT INTO invoice_lines
                (id, invoice_id, usage_type, quantity, unit_price_cents, line_total_cents, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(line.id)
        .bind(invoice.id)
        .bind(line.usage_type.map(|t| t.as_str()))
        .bind(line.quantity)
        .bind(line.unit_price_cents)
        .bind(line.line_total_cents)
        .bind(&line.description)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl InvoiceStore for PgInvoiceStore {
    async fn create_invoice(&self, invoice: &Invoice) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        insert_invoice(&mut tx, invoice).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices \
             WHERE tenant_id = $1 AND billing_year = $2 AND billing_month = $3"
        ))
        .bind(tenant_id)
        .bind(period.year())
        .bind(i16::from(period.month()))
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn get_invoice_by_id(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE invoice_id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate(row).await
    }

    async fn delete_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome> {
        // lines go with the header (ON DELETE CASCADE)
        let result = sqlx::query("DELETE FROM invoices WHERE invoice_id = $1 AND status = 'DRAFT'")
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;
        Ok(cas(result.rows_affected()))
    }

    async fn replace_draft_invoice(
        &self,
        draft_id: Uuid,
        replacement: &Invoice,
    ) -> BillingResult<CasOutcome> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM invoices WHERE invoice_id = $1 AND status = 'DRAFT'")
            .bind(draft_id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CasOutcome::Unchanged);
        }

        insert_invoice(&mut tx, replacement).await?;
        tx.commit().await?;
        Ok(CasOutcome::Applied)
    }

    async fn finalize_invoice(&self, invoice_id: Uuid) -> BillingResult<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'FINALIZED', finalized_at = NOW(), updated_at = NOW()
            WHERE invoice_id = $1 AND status = 'DRAFT'
            "#,
        )
        .bind(invoice_id)
        .execute(&self.pool)
        .await?;
        Ok(cas(result.rows_affected()))
    }

    async fn mark_invoice_paid(
        &self,
        invoice_id: Uuid,
        payment_reference: &str,
    ) -> BillingResult<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'PAID', payment_reference = $2, paid_at = NOW(), updated_at = NOW()
            WHERE invoice_id = $1 AND status = 'FINALIZED'
            "#,
        )
        .bind(invoice_id)
        .bind(payment_reference)
        .execute(&self.pool)
        .await?;
        Ok(cas(result.rows_affected()))
    }
}

// =============================================================================
// Payment attempts
// =============================================================================

pub struct PgPaymentAttemptStore {
    pool: PgPool,
}

impl PgPaymentAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    attempt_id: Uuid,
    invoice_id: Uuid,
    tenant_id: Uuid,
    provider: String,
    provider_payment_id: Option<String>,
    status: String,
    amount_cents: i64,
    currency: String,
    error_code: Option<String>,
    error_message: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AttemptRow> for PaymentAttempt {
    type Error = BillingError;

    fn try_from(row: AttemptRow) -> BillingResult<Self> {
        Ok(PaymentAttempt {
            id: row.attempt_id,
            invoice_id: row.invoice_id,
            tenant_id: row.tenant_id,
            provider: row.provider,
            provider_payment_id: row.provider_payment_id,
            status: row.status.parse()?,
            amount_cents: row.amount_cents,
            currency: row.currency.trim().to_string(),
            error_code: row.error_code,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ATTEMPT_COLUMNS: &str = "attempt_id, invoice_id, tenant_id, provider, provider_payment_id, \
     status, amount_cents, currency, error_code, error_message, created_at, updated_at";

#[async_trait]
impl PaymentAttemptStore for PgPaymentAttemptStore {
    async fn create_payment_attempt(&self, attempt: &PaymentAttempt) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_attempts
                (attempt_id, invoice_id, tenant_id, provider, provider_payment_id, status,
                 amount_cents, currency, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(attempt.id)
        .bind(attempt.invoice_id)
        .bind(attempt.tenant_id)
        .bind(&attempt.provider)
        .bind(attempt.provider_payment_id.as_deref())
        .bind(attempt.status.as_str())
        .bind(attempt.amount_cents)
        .bind(&attempt.currency)
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attempt_status(
        &self,
        attempt_id: Uuid,
        update: &AttemptUpdate,
    ) -> BillingResult<CasOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE payment_attempts
            SET status = $2,
                provider_payment_id = COALESCE(NULLIF($3, ''), provider_payment_id),
                error_code = $4,
                error_message = $5,
                updated_at = NOW()
            WHERE attempt_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(attempt_id)
        .bind(update.status.as_str())
        .bind(update.provider_payment_id.as_deref())
        .bind(update.error_code.as_deref())
        .bind(update.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(cas(result.rows_affected()))
    }

    async fn get_pending_attempts(
        &self,
        limit: i64,
        older_than: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentAttempt>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts \
             WHERE status = 'PENDING' AND created_at < $1 \
             ORDER BY created_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentAttempt::try_from).collect()
    }

    async fn get_attempt_by_provider_id(
        &self,
        provider_payment_id: &str,
    ) -> BillingResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts WHERE provider_payment_id = $1"
        ))
        .bind(provider_payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn get_attempt(&self, attempt_id: Uuid) -> BillingResult<Option<PaymentAttempt>> {
        let row: Option<AttemptRow> = sqlx::query_as(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM payment_attempts WHERE attempt_id = $1"
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentAttempt::try_from).transpose()
    }
}

// =============================================================================
// Accounts
// =============================================================================

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountProvider for PgAccountStore {
    async fn get_billing_account_details(&self, tenant_id: Uuid) -> BillingResult<BillingAccount> {
        let row: Option<(String, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT email, stripe_customer_id, payment_method_id FROM billing_accounts WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let (email, customer_id, payment_method_id) = row
            .ok_or_else(|| BillingError::NotFound(format!("billing account for tenant {tenant_id}")))?;

        match (customer_id, payment_method_id) {
            (Some(customer_id), Some(payment_method_id))
                if !customer_id.is_empty() && !payment_method_id.is_empty() =>
            {
                Ok(BillingAccount {
                    customer_id,
                    payment_method_id,
                    email,
                })
            }
            _ => Err(BillingError::InvalidInput(format!(
                "billing details incomplete for tenant {tenant_id}"
            ))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::invoice::InvoiceStatus;
    use crate::payment::models::PaymentStatus;
    use meterbook_shared::{create_pool, run_migrations, DatabaseConfig, TransactionType};

    async fn pool() -> PgPool {
        let config = DatabaseConfig::from_env().expect("DATABASE_URL must be set");
        let pool = create_pool(&config).await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[test]
    fn test_period_from_row() {
        assert_eq!(
            period_from_row(2024, 6).unwrap(),
            BillingPeriod::new(2024, 6).unwrap()
        );
        assert!(period_from_row(2024, 13).is_err());
        assert!(period_from_row(2024, -1).is_err());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_flush_is_idempotent_per_batch() {
        let store = PgUsageStore::new(pool().await);
        let tenant_id = Uuid::new_v4();
        let period = BillingPeriod::new(2031, 3).unwrap();
        let batch = FlushBatch {
            batch_id: Uuid::new_v4(),
            records: vec![UsageRecord {
                tenant_id,
                usage_type: UsageType::ApiRequest,
                total_quantity: 1_000,
                period,
            }],
        };

        assert_eq!(store.flush(&batch).await.unwrap(), FlushOutcome::Applied);
        assert_eq!(store.flush(&batch).await.unwrap(), FlushOutcome::Duplicate);

        let usage = store.get_usage_for_period(period).await.unwrap();
        let mine: Vec<_> = usage.iter().filter(|r| r.tenant_id == tenant_id).collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].total_quantity, 1_000);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_ledger_insert_is_idempotent() {
        let store = PgLedgerStore::new(pool().await);
        let period = BillingPeriod::new(2031, 3).unwrap();
        let entry = LedgerEntry {
            entry_id: format!("test_{}", Uuid::new_v4()),
            tenant_id: Uuid::new_v4(),
            transaction_type: TransactionType::Debit,
            amount_cents: 500,
            currency: "USD".into(),
            usage_type: Some(UsageType::ShipmentCreated),
            quantity: 10,
            unit_price_cents: 50,
            description: "test".into(),
            period,
            created_at: OffsetDateTime::now_utc(),
        };

        assert_eq!(store.create_ledger_entry(&entry).await.unwrap(), LedgerWrite::Inserted);
        assert_eq!(store.create_ledger_entry(&entry).await.unwrap(), LedgerWrite::Duplicate);
        let entries = store.get_entries_for_period(entry.tenant_id, period).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id, entry.entry_id);
        assert_eq!(entries[0].period, period);
        assert_eq!(entries[0].usage_type, Some(UsageType::ShipmentCreated));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_invoice_transitions_are_conditional() {
        let pool = pool().await;
        let invoices = PgInvoiceStore::new(pool.clone());
        let attempts = PgPaymentAttemptStore::new(pool);

        let invoice = Invoice {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            period: BillingPeriod::new(2031, 4).unwrap(),
            total_cents: 600,
            currency: "USD".into(),
            status: InvoiceStatus::Draft,
            lines: vec![InvoiceLine {
                id: Uuid::new_v4(),
                usage_type: Some(UsageType::ApiRequest),
                quantity: 600,
                unit_price_cents: 1,
                line_total_cents: 600,
                description: "API_REQUEST Charges".into(),
            }],
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };
        invoices.create_invoice(&invoice).await.unwrap();

        assert_eq!(invoices.mark_invoice_paid(invoice.id, "pi_x").await.unwrap(), CasOutcome::Unchanged);
        assert_eq!(invoices.finalize_invoice(invoice.id).await.unwrap(), CasOutcome::Applied);
        assert_eq!(invoices.finalize_invoice(invoice.id).await.unwrap(), CasOutcome::Unchanged);
        assert_eq!(invoices.delete_invoice(invoice.id).await.unwrap(), CasOutcome::Unchanged);

        let attempt = PaymentAttempt::pending(invoice.id, invoice.tenant_id, "Stripe", 600, "USD");
        attempts.create_payment_attempt(&attempt).await.unwrap();
        let update = AttemptUpdate::succeeded(format!("pi_{}", attempt.id.simple()));
        assert_eq!(attempts.update_attempt_status(attempt.id, &update).await.unwrap(), CasOutcome::Applied);
        assert_eq!(attempts.update_attempt_status(attempt.id, &update).await.unwrap(), CasOutcome::Unchanged);

        let stored = attempts.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Succeeded);

        assert_eq!(invoices.mark_invoice_paid(invoice.id, "pi_x").await.unwrap(), CasOutcome::Applied);
        let paid = invoices.get_invoice_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert_eq!(paid.payment_reference.as_deref(), Some("pi_x"));
        assert_eq!(paid.lines.len(), 1);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_replace_draft_is_atomic() {
        let invoices = PgInvoiceStore::new(pool().await);
        let draft = Invoice {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            period: BillingPeriod::new(2031, 5).unwrap(),
            total_cents: 100,
            currency: "USD".into(),
            status: InvoiceStatus::Draft,
            lines: vec![],
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };
        invoices.create_invoice(&draft).await.unwrap();

        let rebuilt = Invoice {
            id: Uuid::new_v4(),
            total_cents: 250,
            ..draft.clone()
        };
        assert_eq!(
            invoices.replace_draft_invoice(draft.id, &rebuilt).await.unwrap(),
            CasOutcome::Applied
        );
        assert!(invoices.get_invoice_by_id(draft.id).await.unwrap().is_none());

        // a finalized invoice is never swapped out
        invoices.finalize_invoice(rebuilt.id).await.unwrap();
        let another = Invoice {
            id: Uuid::new_v4(),
            ..draft
        };
        assert_eq!(
            invoices.replace_draft_invoice(rebuilt.id, &another).await.unwrap(),
            CasOutcome::Unchanged
        );
        let stored = invoices
            .get_invoice(rebuilt.tenant_id, rebuilt.period)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.id, rebuilt.id);
        assert_eq!(stored.total_cents, 250);
    }
}
