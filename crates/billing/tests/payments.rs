//! Payment collection, webhook results and crash recovery

#![allow(clippy::unwrap_used)]

use async_trait::async_trait;
use meterbook_billing::payment::{
    BillingAccount, GatewayError, PaymentAttempt, PaymentGateway, PaymentRequest, PaymentResult,
    PaymentStatus, RetryPolicy,
};
use meterbook_billing::store::memory::{
    InMemoryAccountStore, InMemoryInvoiceStore, InMemoryLedgerStore, InMemoryPaymentAttemptStore,
};
use meterbook_billing::store::{InvoiceStore, PaymentAttemptStore};
use meterbook_billing::{
    Invoice, InvoiceStatus, PaymentConfig, PaymentOutcome, PaymentService, Reconciler,
    ReconcilerConfig,
};
use meterbook_shared::{BillingPeriod, TransactionType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Succeeds after a delay and remembers every idempotency key it saw
#[derive(Default)]
struct SlowGateway {
    charges: AtomicUsize,
    keys: Mutex<Vec<Uuid>>,
    statuses: Mutex<HashMap<String, PaymentStatus>>,
}

#[async_trait]
impl PaymentGateway for SlowGateway {
    fn provider(&self) -> &str {
        "Stripe"
    }

    async fn charge_attempt(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError> {
        self.charges.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(request.attempt_id);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(PaymentResult {
            provider_payment_id: format!("pi_{}", request.attempt_id.simple()),
            status: PaymentStatus::Succeeded,
        })
    }

    async fn get_payment_status(&self, id: &str) -> Result<PaymentStatus, GatewayError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(PaymentStatus::Pending))
    }
}

struct World {
    invoices: Arc<InMemoryInvoiceStore>,
    attempts: Arc<InMemoryPaymentAttemptStore>,
    ledger: Arc<InMemoryLedgerStore>,
    gateway: Arc<SlowGateway>,
    payments: Arc<PaymentService>,
    tenant_id: Uuid,
}

impl World {
    fn new() -> Self {
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let attempts = Arc::new(InMemoryPaymentAttemptStore::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let gateway = Arc::new(SlowGateway::default());
        let tenant_id = Uuid::new_v4();
        accounts.insert(
            tenant_id,
            BillingAccount {
                customer_id: "cus_test".into(),
                payment_method_id: "pm_test".into(),
                email: "ops@example.com".into(),
            },
        );

        let payments = Arc::new(PaymentService::new(
            invoices.clone(),
            attempts.clone(),
            ledger.clone(),
            accounts,
            gateway.clone(),
            PaymentConfig::default(),
        ));
        Self {
            invoices,
            attempts,
            ledger,
            gateway,
            payments,
            tenant_id,
        }
    }

    async fn finalized_invoice(&self, total_cents: i64) -> Invoice {
        let invoice = Invoice {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            period: BillingPeriod::new(2024, 6).unwrap(),
            total_cents,
            currency: "USD".into(),
            status: InvoiceStatus::Finalized,
            lines: vec![],
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.invoices.create_invoice(&invoice).await.unwrap();
        invoice
    }

    fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            self.attempts.clone(),
            self.gateway.clone(),
            self.invoices.clone(),
            self.payments.clone(),
            ReconcilerConfig::default(),
        ))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fifty_concurrent_payments_charge_once() {
    let world = World::new();
    let invoice = world.finalized_invoice(600).await;

    let callers: Vec<_> = (0..50)
        .map(|_| {
            let payments = Arc::clone(&world.payments);
            tokio::spawn(async move { payments.pay_invoice(invoice.id).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for caller in callers {
        outcomes.push(caller.await.unwrap().unwrap());
    }

    assert_eq!(world.gateway.charges.load(Ordering::SeqCst), 1);
    assert_eq!(world.attempts.attempts_for_invoice(invoice.id).len(), 1);
    // every coalesced caller sees the one result
    let paid = outcomes
        .iter()
        .filter(|o| matches!(o, PaymentOutcome::Paid { .. }))
        .count();
    assert_eq!(paid, 50);

    // a later call finds the invoice settled
    assert_eq!(
        world.payments.pay_invoice(invoice.id).await.unwrap(),
        PaymentOutcome::AlreadyPaid
    );
}

#[tokio::test]
async fn test_attempt_id_is_idempotency_key() {
    let world = World::new();
    let invoice = world.finalized_invoice(600).await;
    world.payments.pay_invoice(invoice.id).await.unwrap();

    let attempt = world.attempts.attempts_for_invoice(invoice.id).remove(0);
    assert_eq!(*world.gateway.keys.lock().unwrap(), vec![attempt.id]);
    assert_ne!(attempt.id, invoice.id);
}

#[tokio::test]
async fn test_payment_is_booked_once_in_ledger() {
    let world = World::new();
    let invoice = world.finalized_invoice(600).await;
    let outcome = world.payments.pay_invoice(invoice.id).await.unwrap();
    let PaymentOutcome::Paid { reference } = outcome else {
        panic!("expected Paid, got {outcome:?}");
    };

    // a repeated success signal (webhook, reconciler) must not double-book
    world
        .payments
        .finalize_successful_payment(&invoice, &reference)
        .await
        .unwrap();

    let payments: Vec<_> = world
        .ledger
        .entries()
        .into_iter()
        .filter(|e| e.transaction_type == TransactionType::Payment)
        .collect();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].amount_cents, 600);
}

#[test]
fn test_retry_classification() {
    let unavailable = GatewayError::Provider {
        status: 503,
        code: None,
        message: "Service Unavailable".into(),
        payment_id: None,
    };
    let declined = GatewayError::Provider {
        status: 402,
        code: Some("card_declined".into()),
        message: "Your card was declined.".into(),
        payment_id: None,
    };
    assert!(RetryPolicy::is_retryable(&unavailable));
    assert!(!RetryPolicy::is_retryable(&declined));
}

#[tokio::test]
async fn test_reconciler_recovers_crashed_flows() {
    let world = World::new();
    let stale = OffsetDateTime::now_utc() - time::Duration::minutes(30);

    // crashed before the gateway call
    let lost = world.finalized_invoice(600).await;
    let mut never_sent = PaymentAttempt::pending(lost.id, world.tenant_id, "Stripe", 600, "USD");
    never_sent.created_at = stale;
    world.attempts.create_payment_attempt(&never_sent).await.unwrap();

    // crashed after the gateway charged
    let charged = world.finalized_invoice(900).await;
    let mut in_doubt = PaymentAttempt::pending(charged.id, world.tenant_id, "Stripe", 900, "USD");
    in_doubt.provider_payment_id = Some("pi_in_doubt".into());
    in_doubt.created_at = stale;
    world.attempts.create_payment_attempt(&in_doubt).await.unwrap();
    world
        .gateway
        .statuses
        .lock()
        .unwrap()
        .insert("pi_in_doubt".into(), PaymentStatus::Succeeded);

    let summary = world.reconciler().reconcile_once().await.unwrap();
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.failed_pre_flight, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(world.gateway.charges.load(Ordering::SeqCst), 0);

    let never_sent = world.attempts.get_attempt(never_sent.id).await.unwrap().unwrap();
    assert_eq!(never_sent.status, PaymentStatus::Failed);
    let lost = world.invoices.get_invoice_by_id(lost.id).await.unwrap().unwrap();
    assert_eq!(lost.status, InvoiceStatus::Finalized);

    let in_doubt = world.attempts.get_attempt(in_doubt.id).await.unwrap().unwrap();
    assert_eq!(in_doubt.status, PaymentStatus::Succeeded);
    let charged = world.invoices.get_invoice_by_id(charged.id).await.unwrap().unwrap();
    assert_eq!(charged.status, InvoiceStatus::Paid);

    // the failed invoice can be paid again with a fresh attempt
    world.payments.pay_invoice(lost.id).await.unwrap();
    let attempts = world.attempts.attempts_for_invoice(lost.id);
    assert_eq!(attempts.len(), 2);
}
