//! Invoice payment collection
//!
//! Flow for one invoice:
//! 1. Coalesce concurrent callers per invoice so one flow runs
//! 2. Re-read the invoice (PAID is success, anything but FINALIZED is an error)
//! 3. Write a PENDING attempt before touching the gateway
//! 4. Charge with the attempt id as idempotency key, retrying transient failures
//! 5. On success mark the attempt, the invoice and the ledger
//!
//! A crash between 3 and 5 leaves a PENDING attempt that the reconciler repairs.

use meterbook_shared::TransactionType;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::gateway::{GatewayError, PaymentGateway};
use super::models::{
    AttemptUpdate, PaymentAttempt, PaymentOutcome, PaymentRequest, PaymentResult, PaymentStatus,
    ZERO_AMOUNT_REFERENCE,
};
use super::retry::RetryPolicy;
use super::singleflight::SingleFlight;
use super::webhook::NormalizedPaymentEvent;
use crate::config::PaymentConfig;
use crate::error::{BillingError, BillingResult};
use crate::invoice::{Invoice, InvoiceStatus};
use crate::ledger::{payment_entry_id, LedgerEntry};
use crate::store::{AccountProvider, CasOutcome, InvoiceStore, LedgerStore, PaymentAttemptStore};

pub struct PaymentService {
    invoices: Arc<dyn InvoiceStore>,
    attempts: Arc<dyn PaymentAttemptStore>,
    ledger: Arc<dyn LedgerStore>,
    accounts: Arc<dyn AccountProvider>,
    gateway: Arc<dyn PaymentGateway>,
    config: PaymentConfig,
    retry: RetryPolicy,
    flights: SingleFlight<Uuid, PaymentOutcome>,
    shutdown: CancellationToken,
}

impl PaymentService {
    pub fn new(
        invoices: Arc<dyn InvoiceStore>,
        attempts: Arc<dyn PaymentAttemptStore>,
        ledger: Arc<dyn LedgerStore>,
        accounts: Arc<dyn AccountProvider>,
        gateway: Arc<dyn PaymentGateway>,
        config: PaymentConfig,
    ) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            invoices,
            attempts,
            ledger,
            accounts,
            gateway,
            config,
            flights: SingleFlight::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Abort in-progress retry loops when `token` is cancelled
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Collect payment for a FINALIZED invoice.
    ///
    /// Concurrent calls for the same invoice share a single execution and its
    /// outcome.
    pub async fn pay_invoice(&self, invoice_id: Uuid) -> BillingResult<PaymentOutcome> {
        self.flights
            .run(invoice_id, || async {
                match tokio::time::timeout(self.config.flow_timeout, self.process_payment(invoice_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(invoice_id = %invoice_id, "Payment flow timed out");
                        Err(BillingError::Timeout(format!(
                            "payment flow for invoice {invoice_id}"
                        )))
                    }
                }
            })
            .await
    }

    async fn process_payment(&self, invoice_id: Uuid) -> BillingResult<PaymentOutcome> {
        let invoice = self
            .invoices
            .get_invoice_by_id(invoice_id)
            .await?
            .ok_or_else(|| BillingError::InvoiceNotFound(invoice_id.to_string()))?;

        match invoice.status {
            InvoiceStatus::Paid => {
                tracing::debug!(invoice_id = %invoice_id, "Invoice already paid");
                return Ok(PaymentOutcome::AlreadyPaid);
            }
            InvoiceStatus::Finalized => {}
            status => return Err(BillingError::InvoiceNotPayable { status }),
        }

        if invoice.total_cents == 0 {
            self.finalize_successful_payment(&invoice, ZERO_AMOUNT_REFERENCE)
                .await?;
            tracing::info!(invoice_id = %invoice_id, "Zero-amount invoice settled without charge");
            return Ok(PaymentOutcome::Paid {
                reference: ZERO_AMOUNT_REFERENCE.to_string(),
            });
        }

        let account = self
            .accounts
            .get_billing_account_details(invoice.tenant_id)
            .await?;

        let attempt = PaymentAttempt::pending(
            invoice.id,
            invoice.tenant_id,
            self.gateway.provider(),
            invoice.total_cents,
            invoice.currency.clone(),
        );
        self.attempts.create_payment_attempt(&attempt).await?;

        tracing::info!(
            invoice_id = %invoice.id,
            attempt_id = %attempt.id,
            amount_cents = invoice.total_cents,
            "Payment attempt recorded, charging"
        );

        let request = PaymentRequest {
            attempt_id: attempt.id,
            invoice_id: invoice.id,
            tenant_id: invoice.tenant_id,
            amount_cents: invoice.total_cents,
            currency: invoice.currency.clone(),
            customer_id: account.customer_id,
            payment_method_id: account.payment_method_id,
            description: format!("Invoice #{} for {}", invoice.id, account.email),
        };

        match self.execute_with_retry(&request).await {
            Ok(PaymentResult {
                provider_payment_id,
                status: PaymentStatus::Succeeded,
            }) => {
                self.record_attempt(attempt.id, &AttemptUpdate::succeeded(&provider_payment_id))
                    .await;
                self.finalize_successful_payment(&invoice, &provider_payment_id)
                    .await?;
                Ok(PaymentOutcome::Paid {
                    reference: provider_payment_id,
                })
            }
            Ok(PaymentResult {
                provider_payment_id,
                status: PaymentStatus::Failed | PaymentStatus::RequiresAction,
            }) => {
                let err = GatewayError::Provider {
                    status: 402,
                    code: None,
                    message: "payment was not completed".to_string(),
                    payment_id: Some(provider_payment_id),
                };
                Err(self.fail_attempt(&attempt, err).await)
            }
            Ok(PaymentResult {
                provider_payment_id,
                ..
            }) => {
                // settled later through a webhook or the reconciler
                let update = AttemptUpdate {
                    status: PaymentStatus::Pending,
                    provider_payment_id: Some(provider_payment_id.clone()),
                    error_code: None,
                    error_message: None,
                };
                self.record_attempt(attempt.id, &update).await;
                tracing::info!(
                    attempt_id = %attempt.id,
                    provider_payment_id = %provider_payment_id,
                    "Payment is processing at the provider"
                );
                Ok(PaymentOutcome::Processing {
                    attempt_id: attempt.id,
                    provider_payment_id,
                })
            }
            Err(BillingError::Gateway(err)) => Err(self.fail_attempt(&attempt, err).await),
            Err(err) => {
                // cancelled mid-flight: outcome unknown, leave PENDING for the reconciler
                tracing::warn!(attempt_id = %attempt.id, error = %err, "Payment interrupted");
                Err(err)
            }
        }
    }

    /// Charge with bounded retries, stopping early on shutdown
    async fn execute_with_retry(&self, request: &PaymentRequest) -> BillingResult<PaymentResult> {
        let gateway = &self.gateway;
        let call_timeout = self.config.gateway_timeout;

        let charge = self.retry.run(|| async move {
            match tokio::time::timeout(call_timeout, gateway.charge_attempt(request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            }
        });

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(BillingError::Cancelled(format!(
                "payment attempt {} interrupted by shutdown",
                request.attempt_id
            ))),
            result = charge => result.map_err(BillingError::from),
        }
    }

    async fn fail_attempt(&self, attempt: &PaymentAttempt, err: GatewayError) -> BillingError {
        let update = AttemptUpdate {
            status: err.attempt_status(),
            provider_payment_id: err.payment_id().map(str::to_string),
            error_code: Some(err.error_code()),
            error_message: Some(err.to_string()),
        };
        self.record_attempt(attempt.id, &update).await;

        tracing::warn!(
            invoice_id = %attempt.invoice_id,
            attempt_id = %attempt.id,
            code = %err.error_code(),
            error = %err,
            "Payment failed, invoice stays FINALIZED"
        );
        BillingError::PaymentFailed {
            attempt_id: attempt.id,
            reason: err.to_string(),
        }
    }

    /// Attempt bookkeeping never fails the flow; the reconciler repairs it
    async fn record_attempt(&self, attempt_id: Uuid, update: &AttemptUpdate) {
        match self.attempts.update_attempt_status(attempt_id, update).await {
            Ok(CasOutcome::Applied) => {}
            Ok(CasOutcome::Unchanged) => {
                tracing::warn!(attempt_id = %attempt_id, status = %update.status, "Attempt was no longer PENDING")
            }
            Err(e) => tracing::error!(
                attempt_id = %attempt_id,
                status = %update.status,
                error = %e,
                "Failed to update payment attempt"
            ),
        }
    }

    /// What happens once money has moved: invoice to PAID, then the ledger.
    ///
    /// Used by the synchronous flow, webhooks and the reconciler. A failed
    /// invoice update is critical. A failed ledger write is only logged.
    pub async fn finalize_successful_payment(
        &self,
        invoice: &Invoice,
        reference: &str,
    ) -> BillingResult<()> {
        let not_recorded = |reason: String| BillingError::PaymentNotRecorded {
            invoice_id: invoice.id,
            transaction_id: reference.to_string(),
            reason,
        };

        match self.invoices.mark_invoice_paid(invoice.id, reference).await {
            Ok(CasOutcome::Applied) => {
                tracing::info!(
                    invoice_id = %invoice.id,
                    tenant_id = %invoice.tenant_id,
                    reference,
                    "Invoice marked paid"
                );
            }
            Ok(CasOutcome::Unchanged) => {
                let current = self.invoices.get_invoice_by_id(invoice.id).await?;
                match current.map(|i| i.status) {
                    Some(InvoiceStatus::Paid) => {
                        tracing::debug!(invoice_id = %invoice.id, "Invoice was already paid");
                    }
                    status => {
                        tracing::error!(
                            critical = true,
                            invoice_id = %invoice.id,
                            reference,
                            ?status,
                            "Payment captured but invoice could not be marked paid"
                        );
                        return Err(not_recorded(format!("invoice in status {status:?}")));
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    critical = true,
                    invoice_id = %invoice.id,
                    reference,
                    error = %e,
                    "Payment captured but invoice update failed"
                );
                return Err(not_recorded(e.to_string()));
            }
        }

        if invoice.total_cents > 0 {
            let entry = LedgerEntry {
                entry_id: payment_entry_id(invoice.id),
                tenant_id: invoice.tenant_id,
                transaction_type: TransactionType::Payment,
                amount_cents: invoice.total_cents,
                currency: invoice.currency.clone(),
                usage_type: None,
                quantity: 0,
                unit_price_cents: 0,
                description: format!("Payment for invoice {} ({reference})", invoice.id),
                period: invoice.period,
                created_at: OffsetDateTime::now_utc(),
            };
            if let Err(e) = self.ledger.create_ledger_entry(&entry).await {
                tracing::error!(
                    invoice_id = %invoice.id,
                    entry_id = %entry.entry_id,
                    error = %e,
                    "Failed to book payment in ledger"
                );
            }
        }
        Ok(())
    }

    /// Apply an asynchronous result reported by the provider (webhook)
    pub async fn handle_async_result(&self, event: &NormalizedPaymentEvent) -> BillingResult<()> {
        let Some(attempt) = self
            .attempts
            .get_attempt_by_provider_id(&event.provider_payment_id)
            .await?
        else {
            tracing::warn!(
                provider_payment_id = %event.provider_payment_id,
                "Webhook for unknown payment, ignoring"
            );
            return Ok(());
        };

        if attempt.status == event.status || attempt.status == PaymentStatus::Succeeded {
            tracing::debug!(attempt_id = %attempt.id, status = %attempt.status, "Webhook is a no-op");
            return Ok(());
        }

        let update = AttemptUpdate {
            status: event.status,
            provider_payment_id: Some(event.provider_payment_id.clone()),
            error_code: event.error_code.clone(),
            error_message: event.error_message.clone(),
        };
        if !self.attempts.update_attempt_status(attempt.id, &update).await?.applied() {
            tracing::debug!(attempt_id = %attempt.id, "Attempt settled concurrently");
            return Ok(());
        }

        tracing::info!(
            attempt_id = %attempt.id,
            invoice_id = %attempt.invoice_id,
            status = %event.status,
            "Payment attempt updated from webhook"
        );

        if event.status == PaymentStatus::Succeeded {
            let invoice = self
                .invoices
                .get_invoice_by_id(attempt.invoice_id)
                .await?
                .ok_or_else(|| BillingError::InvoiceNotFound(attempt.invoice_id.to_string()))?;
            self.finalize_successful_payment(&invoice, &event.provider_payment_id)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]  // Allow unwrap() in tests for cleaner test code
mod tests {
    use super::*;
    use crate::payment::models::BillingAccount;
    use crate::store::memory::{
        InMemoryAccountStore, InMemoryInvoiceStore, InMemoryLedgerStore,
        InMemoryPaymentAttemptStore,
    };
    use async_trait::async_trait;
    use meterbook_shared::BillingPeriod;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replays scripted responses, then succeeds
    struct ScriptedGateway {
        script: Mutex<VecDeque<Result<PaymentResult, GatewayError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<PaymentResult, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn provider(&self) -> &str {
            "Stripe"
        }

        async fn charge_attempt(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentResult, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(PaymentResult {
                    provider_payment_id: format!("pi_{}", request.attempt_id.simple()),
                    status: PaymentStatus::Succeeded,
                })
            })
        }

        async fn get_payment_status(&self, _id: &str) -> Result<PaymentStatus, GatewayError> {
            Ok(PaymentStatus::Succeeded)
        }
    }

    struct Harness {
        invoices: Arc<InMemoryInvoiceStore>,
        attempts: Arc<InMemoryPaymentAttemptStore>,
        ledger: Arc<InMemoryLedgerStore>,
        gateway: Arc<ScriptedGateway>,
        service: PaymentService,
    }

    fn harness(script: Vec<Result<PaymentResult, GatewayError>>) -> Harness {
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let attempts = Arc::new(InMemoryPaymentAttemptStore::new());
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let gateway = Arc::new(ScriptedGateway::new(script));
        let config = PaymentConfig {
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
            ..PaymentConfig::default()
        };
        let service = PaymentService::new(
            invoices.clone(),
            attempts.clone(),
            ledger.clone(),
            accounts.clone(),
            gateway.clone(),
            config,
        );
        Harness {
            invoices,
            attempts,
            ledger,
            gateway,
            service,
        }
        .with_account(accounts)
    }

    impl Harness {
        fn with_account(self, accounts: Arc<InMemoryAccountStore>) -> Self {
            accounts.insert(
                TENANT,
                BillingAccount {
                    customer_id: "cus_123".into(),
                    payment_method_id: "pm_123".into(),
                    email: "billing@example.com".into(),
                },
            );
            self
        }

        async fn invoice(&self, total_cents: i64, status: InvoiceStatus) -> Invoice {
            let invoice = Invoice {
                id: Uuid::new_v4(),
                tenant_id: TENANT,
                period: BillingPeriod::new(2024, 6).unwrap(),
                total_cents,
                currency: "USD".into(),
                status,
                lines: vec![],
                payment_reference: None,
                created_at: OffsetDateTime::now_utc(),
            };
            self.invoices.create_invoice(&invoice).await.unwrap();
            invoice
        }
    }

    const TENANT: Uuid = Uuid::from_u128(0x5eed);

    fn decline() -> GatewayError {
        GatewayError::Provider {
            status: 402,
            code: Some("card_declined".into()),
            message: "Your card was declined.".into(),
            payment_id: Some("pi_declined".into()),
        }
    }

    #[tokio::test]
    async fn test_successful_payment_marks_everything() {
        let h = harness(vec![]);
        let invoice = h.invoice(600, InvoiceStatus::Finalized).await;

        let outcome = h.service.pay_invoice(invoice.id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Paid { .. }));

        let stored = h.invoices.get_invoice_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);

        let attempts = h.attempts.attempts_for_invoice(invoice.id);
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].status, PaymentStatus::Succeeded);
        assert_eq!(attempts[0].provider, "Stripe");

        let entries = h.ledger.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction_type, TransactionType::Payment);
        assert_eq!(entries[0].amount_cents, 600);
    }

    #[tokio::test]
    async fn test_paid_invoice_is_idempotent_success() {
        let h = harness(vec![]);
        let invoice = h.invoice(600, InvoiceStatus::Paid).await;
        assert_eq!(
            h.service.pay_invoice(invoice.id).await.unwrap(),
            PaymentOutcome::AlreadyPaid
        );
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_draft_invoice_is_not_payable() {
        let h = harness(vec![]);
        let invoice = h.invoice(600, InvoiceStatus::Draft).await;
        assert!(matches!(
            h.service.pay_invoice(invoice.id).await,
            Err(BillingError::InvoiceNotPayable {
                status: InvoiceStatus::Draft
            })
        ));
    }

    #[tokio::test]
    async fn test_zero_amount_skips_gateway() {
        let h = harness(vec![]);
        let invoice = h.invoice(0, InvoiceStatus::Finalized).await;

        let outcome = h.service.pay_invoice(invoice.id).await.unwrap();
        assert_eq!(
            outcome,
            PaymentOutcome::Paid {
                reference: ZERO_AMOUNT_REFERENCE.to_string()
            }
        );
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 0);
        assert!(h.attempts.attempts_for_invoice(invoice.id).is_empty());
        assert!(h.ledger.entries().is_empty());
    }

    #[tokio::test]
    async fn test_decline_is_terminal_and_invoice_stays_finalized() {
        let h = harness(vec![Err(decline())]);
        let invoice = h.invoice(600, InvoiceStatus::Finalized).await;

        let err = h.service.pay_invoice(invoice.id).await.unwrap_err();
        assert!(matches!(err, BillingError::PaymentFailed { .. }));
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 1);

        let attempt = &h.attempts.attempts_for_invoice(invoice.id)[0];
        assert_eq!(attempt.status, PaymentStatus::Failed);
        assert_eq!(attempt.error_code.as_deref(), Some("card_declined"));
        assert_eq!(attempt.provider_payment_id.as_deref(), Some("pi_declined"));

        let stored = h.invoices.get_invoice_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Finalized);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_with_same_key() {
        let unavailable = GatewayError::Provider {
            status: 503,
            code: None,
            message: "unavailable".into(),
            payment_id: None,
        };
        let h = harness(vec![Err(unavailable.clone()), Err(GatewayError::Timeout)]);
        let invoice = h.invoice(600, InvoiceStatus::Finalized).await;

        h.service.pay_invoice(invoice.id).await.unwrap();
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.attempts.attempts_for_invoice(invoice.id).len(), 1);
    }

    /// First charge never answers; later ones succeed
    #[derive(Default)]
    struct HangsOnceGateway {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for HangsOnceGateway {
        fn provider(&self) -> &str {
            "Stripe"
        }

        async fn charge_attempt(
            &self,
            request: &PaymentRequest,
        ) -> Result<PaymentResult, GatewayError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Ok(PaymentResult {
                provider_payment_id: format!("pi_{}", request.attempt_id.simple()),
                status: PaymentStatus::Succeeded,
            })
        }

        async fn get_payment_status(&self, _id: &str) -> Result<PaymentStatus, GatewayError> {
            Ok(PaymentStatus::Succeeded)
        }
    }

    #[tokio::test]
    async fn test_timed_out_call_is_retried_within_flow_deadline() {
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let attempts = Arc::new(InMemoryPaymentAttemptStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let gateway = Arc::new(HangsOnceGateway::default());
        accounts.insert(
            TENANT,
            BillingAccount {
                customer_id: "cus_123".into(),
                payment_method_id: "pm_123".into(),
                email: "billing@example.com".into(),
            },
        );

        let config = PaymentConfig {
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
            gateway_timeout: Duration::from_millis(50),
            ..PaymentConfig::default()
        }
        .with_budgeted_flow_timeout();
        assert!(config.flow_timeout > config.gateway_timeout * 4);

        let service = PaymentService::new(
            invoices.clone(),
            attempts.clone(),
            Arc::new(InMemoryLedgerStore::new()),
            accounts,
            gateway.clone(),
            config,
        );
        let invoice = Invoice {
            id: Uuid::new_v4(),
            tenant_id: TENANT,
            period: BillingPeriod::new(2024, 6).unwrap(),
            total_cents: 600,
            currency: "USD".into(),
            status: InvoiceStatus::Finalized,
            lines: vec![],
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };
        invoices.create_invoice(&invoice).await.unwrap();

        let outcome = service.pay_invoice(invoice.id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Paid { .. }));
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 2);

        let attempt = attempts.attempts_for_invoice(invoice.id).remove(0);
        assert_eq!(attempt.status, PaymentStatus::Succeeded);
        assert!(attempt.provider_payment_id.is_some());
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_attempt() {
        let unavailable = || {
            Err(GatewayError::Provider {
                status: 503,
                code: None,
                message: "unavailable".into(),
                payment_id: None,
            })
        };
        let h = harness((0..4).map(|_| unavailable()).collect());
        let invoice = h.invoice(600, InvoiceStatus::Finalized).await;

        assert!(h.service.pay_invoice(invoice.id).await.is_err());
        // first call plus three retries
        assert_eq!(h.gateway.calls.load(Ordering::SeqCst), 4);
        let attempt = &h.attempts.attempts_for_invoice(invoice.id)[0];
        assert_eq!(attempt.status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_processing_result_leaves_attempt_pending() {
        let h = harness(vec![Ok(PaymentResult {
            provider_payment_id: "pi_slow".into(),
            status: PaymentStatus::Pending,
        })]);
        let invoice = h.invoice(600, InvoiceStatus::Finalized).await;

        let outcome = h.service.pay_invoice(invoice.id).await.unwrap();
        assert!(matches!(outcome, PaymentOutcome::Processing { .. }));

        let attempt = &h.attempts.attempts_for_invoice(invoice.id)[0];
        assert_eq!(attempt.status, PaymentStatus::Pending);
        assert_eq!(attempt.provider_payment_id.as_deref(), Some("pi_slow"));

        // the provider later reports success
        let event = NormalizedPaymentEvent {
            provider: "Stripe".into(),
            provider_payment_id: "pi_slow".into(),
            status: PaymentStatus::Succeeded,
            error_code: None,
            error_message: None,
        };
        h.service.handle_async_result(&event).await.unwrap();
        let stored = h.invoices.get_invoice_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);

        // a late failure webhook never overwrites success
        let late = NormalizedPaymentEvent {
            status: PaymentStatus::Failed,
            ..event
        };
        h.service.handle_async_result(&late).await.unwrap();
        let attempt = h.attempts.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(attempt.status, PaymentStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_invoice_not_found() {
        let h = harness(vec![]);
        assert!(matches!(
            h.service.pay_invoice(Uuid::new_v4()).await,
            Err(BillingError::InvoiceNotFound(_))
        ));
    }
}
