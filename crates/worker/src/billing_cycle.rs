//! Monthly billing cycle
//!
//! Books the period's usage, then invoices and charges every tenant that had
//! any. A failing tenant is logged and skipped; a failing `bill_period` aborts
//! the whole cycle since nothing downstream can be trusted.

use std::sync::Arc;

use meterbook_billing::store::InvoiceStore;
use meterbook_billing::{
    BillingCalculator, BillingError, BillingResult, InvoiceFinalizer, InvoiceGenerator,
    InvoiceStatus, PaymentOutcome, PaymentService,
};
use meterbook_shared::BillingPeriod;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a single tenant ended up after the cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantOutcome {
    /// No billable ledger entries in the period
    NothingToBill,
    Paid,
    AlreadyPaid,
    /// Charge accepted, settlement arrives via webhook or reconciler
    Processing,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub tenants: usize,
    pub paid: usize,
    pub already_paid: usize,
    pub processing: usize,
    pub nothing_to_bill: usize,
    pub failed: usize,
}

pub struct BillingCycle {
    calculator: BillingCalculator,
    generator: InvoiceGenerator,
    finalizer: InvoiceFinalizer,
    invoices: Arc<dyn InvoiceStore>,
    payments: Arc<PaymentService>,
}

impl BillingCycle {
    pub fn new(
        calculator: BillingCalculator,
        generator: InvoiceGenerator,
        finalizer: InvoiceFinalizer,
        invoices: Arc<dyn InvoiceStore>,
        payments: Arc<PaymentService>,
    ) -> Self {
        Self {
            calculator,
            generator,
            finalizer,
            invoices,
            payments,
        }
    }

    /// Bill the calendar month before the current one
    pub async fn run_previous_month(&self) -> BillingResult<CycleSummary> {
        self.run(BillingPeriod::current().previous()).await
    }

    pub async fn run(&self, period: BillingPeriod) -> BillingResult<CycleSummary> {
        info!(period = %period, "Billing cycle started");

        let run = self.calculator.bill_period(period).await.map_err(|e| {
            error!(period = %period, error = %e, "Usage billing failed, aborting cycle");
            e
        })?;

        let mut summary = CycleSummary {
            tenants: run.tenants.len(),
            ..CycleSummary::default()
        };

        for tenant_id in run.tenants {
            match self.settle_tenant(tenant_id, period).await {
                Ok(TenantOutcome::Paid) => summary.paid += 1,
                Ok(TenantOutcome::AlreadyPaid) => summary.already_paid += 1,
                Ok(TenantOutcome::Processing) => summary.processing += 1,
                Ok(TenantOutcome::NothingToBill) => summary.nothing_to_bill += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        tenant_id = %tenant_id,
                        period = %period,
                        error = %e,
                        "Failed to settle tenant"
                    );
                }
            }
        }

        info!(
            period = %period,
            tenants = summary.tenants,
            paid = summary.paid,
            already_paid = summary.already_paid,
            processing = summary.processing,
            failed = summary.failed,
            "Billing cycle completed"
        );
        Ok(summary)
    }

    async fn settle_tenant(
        &self,
        tenant_id: Uuid,
        period: BillingPeriod,
    ) -> BillingResult<TenantOutcome> {
        let invoice_id = match self.generator.generate_invoice_for_tenant(tenant_id, period).await {
            Ok(Some(invoice)) => invoice.id,
            Ok(None) => return Ok(TenantOutcome::NothingToBill),
            // a previous run got further than this one; pick up where it stopped
            Err(e) if e.is_already_done() => self.existing_invoice_id(tenant_id, period).await?,
            Err(BillingError::InvoiceNotDraft {
                status: InvoiceStatus::Paid,
            }) => return Ok(TenantOutcome::AlreadyPaid),
            Err(e) => return Err(e),
        };

        match self.finalizer.finalize_invoice(invoice_id).await {
            Ok(_) => {}
            Err(e) if e.is_already_done() => {
                warn!(invoice_id = %invoice_id, "Invoice already finalized, continuing to payment");
            }
            Err(e) => return Err(e),
        }

        Ok(match self.payments.pay_invoice(invoice_id).await? {
            PaymentOutcome::Paid { .. } => TenantOutcome::Paid,
            PaymentOutcome::AlreadyPaid => TenantOutcome::AlreadyPaid,
            PaymentOutcome::Processing { .. } => TenantOutcome::Processing,
        })
    }

    async fn existing_invoice_id(&self, tenant_id: Uuid, period: BillingPeriod) -> BillingResult<Uuid> {
        self.invoices
            .get_invoice(tenant_id, period)
            .await?
            .map(|invoice| invoice.id)
            .ok_or_else(|| {
                BillingError::InvoiceNotFound(format!("tenant {tenant_id} period {period}"))
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meterbook_billing::payment::{
        BillingAccount, GatewayError, PaymentGateway, PaymentRequest, PaymentResult, PaymentStatus,
    };
    use meterbook_billing::store::memory::{
        InMemoryAccountStore, InMemoryInvoiceStore, InMemoryLedgerStore,
        InMemoryPaymentAttemptStore, InMemoryPricingStore, InMemoryUsageStore,
    };
    use meterbook_billing::store::UsageStore;
    use meterbook_billing::usage::{FlushBatch, UsageRecord};
    use meterbook_billing::{PaymentConfig, PriceRule};
    use meterbook_shared::UsageType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use time::macros::datetime;

    #[derive(Default)]
    struct CountingGateway {
        charges: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for CountingGateway {
        fn provider(&self) -> &str {
            "Stripe"
        }

        async fn charge_attempt(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentResult, GatewayError> {
            self.charges.fetch_add(1, Ordering::SeqCst);
            Ok(PaymentResult {
                provider_payment_id: format!("pi_{}", request.attempt_id.simple()),
                status: PaymentStatus::Succeeded,
            })
        }

        async fn get_payment_status(&self, _id: &str) -> Result<PaymentStatus, GatewayError> {
            Ok(PaymentStatus::Succeeded)
        }
    }

    struct Fixture {
        usage: Arc<InMemoryUsageStore>,
        pricing: Arc<InMemoryPricingStore>,
        invoices: Arc<InMemoryInvoiceStore>,
        accounts: Arc<InMemoryAccountStore>,
        gateway: Arc<CountingGateway>,
        cycle: BillingCycle,
    }

    fn fixture() -> Fixture {
        let usage = Arc::new(InMemoryUsageStore::new());
        let pricing = Arc::new(InMemoryPricingStore::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let attempts = Arc::new(InMemoryPaymentAttemptStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let gateway = Arc::new(CountingGateway::default());

        let payments = Arc::new(PaymentService::new(
            invoices.clone(),
            attempts,
            ledger.clone(),
            accounts.clone(),
            gateway.clone(),
            PaymentConfig::default(),
        ));
        let cycle = BillingCycle::new(
            BillingCalculator::new(usage.clone(), pricing.clone(), ledger.clone()),
            InvoiceGenerator::new(ledger, invoices.clone()),
            InvoiceFinalizer::new(invoices.clone()),
            invoices.clone(),
            payments,
        );
        Fixture {
            usage,
            pricing,
            invoices,
            accounts,
            gateway,
            cycle,
        }
    }

    fn period() -> BillingPeriod {
        BillingPeriod::new(2024, 6).unwrap()
    }

    fn rule(usage_type: UsageType, unit_price_cents: i64) -> PriceRule {
        PriceRule {
            id: Uuid::new_v4(),
            tenant_id: None,
            usage_type,
            unit_price_cents,
            currency: "USD".into(),
            tiers: None,
            effective_from: datetime!(2020-01-01 0:00 UTC),
            effective_to: None,
        }
    }

    fn account() -> BillingAccount {
        BillingAccount {
            customer_id: "cus_test".into(),
            payment_method_id: "pm_test".into(),
            email: "billing@example.com".into(),
        }
    }

    async fn record_usage(usage: &InMemoryUsageStore, tenant_id: Uuid, usage_type: UsageType, quantity: i64) {
        usage
            .flush(&FlushBatch {
                batch_id: Uuid::new_v4(),
                records: vec![UsageRecord {
                    tenant_id,
                    usage_type,
                    total_quantity: quantity,
                    period: period(),
                }],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_invoices_and_charges_each_tenant() {
        let f = fixture();
        f.pricing.add_rule(rule(UsageType::ApiRequest, 2));

        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        f.accounts.insert(a, account());
        f.accounts.insert(b, account());
        record_usage(&f.usage, a, UsageType::ApiRequest, 100).await;
        record_usage(&f.usage, b, UsageType::ApiRequest, 300).await;

        let summary = f.cycle.run(period()).await.unwrap();
        assert_eq!(summary.tenants, 2);
        assert_eq!(summary.paid, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(f.gateway.charges.load(Ordering::SeqCst), 2);

        let invoice = f.invoices.get_invoice(b, period()).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.total_cents, 600);
    }

    #[tokio::test]
    async fn test_one_failing_tenant_does_not_stop_others() {
        let f = fixture();
        f.pricing.add_rule(rule(UsageType::ApiRequest, 1));

        let (with_account, without_account) = (Uuid::new_v4(), Uuid::new_v4());
        f.accounts.insert(with_account, account());
        record_usage(&f.usage, with_account, UsageType::ApiRequest, 50).await;
        record_usage(&f.usage, without_account, UsageType::ApiRequest, 50).await;

        let summary = f.cycle.run(period()).await.unwrap();
        assert_eq!(summary.paid, 1);
        assert_eq!(summary.failed, 1);

        // left FINALIZED so the next cycle can retry the charge
        let stuck = f
            .invoices
            .get_invoice(without_account, period())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stuck.status, InvoiceStatus::Finalized);
    }

    #[tokio::test]
    async fn test_rerun_resumes_without_double_charging() {
        let f = fixture();
        f.pricing.add_rule(rule(UsageType::ApiRequest, 1));

        let (paid, stuck) = (Uuid::new_v4(), Uuid::new_v4());
        f.accounts.insert(paid, account());
        record_usage(&f.usage, paid, UsageType::ApiRequest, 10).await;
        record_usage(&f.usage, stuck, UsageType::ApiRequest, 10).await;

        f.cycle.run(period()).await.unwrap();
        assert_eq!(f.gateway.charges.load(Ordering::SeqCst), 1);

        // account shows up before the next run
        f.accounts.insert(stuck, account());
        let summary = f.cycle.run(period()).await.unwrap();
        assert_eq!(summary.already_paid, 1);
        assert_eq!(summary.paid, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(f.gateway.charges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_price_rule_aborts_cycle() {
        let f = fixture();
        let tenant_id = Uuid::new_v4();
        f.accounts.insert(tenant_id, account());
        record_usage(&f.usage, tenant_id, UsageType::ShipmentCreated, 10).await;

        let err = f.cycle.run(period()).await.unwrap_err();
        assert!(matches!(err, BillingError::PriceRuleNotFound { .. }));
        assert!(f.invoices.get_invoice(tenant_id, period()).await.unwrap().is_none());
        assert_eq!(f.gateway.charges.load(Ordering::SeqCst), 0);
    }
}
