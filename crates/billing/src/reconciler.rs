//! Repairs payment attempts left PENDING by crashes or lost responses
//!
//! Each tick scans stale PENDING attempts and settles them against the gateway:
//! - no provider id recorded: the process died before the charge was accepted,
//!   so the attempt is failed without asking the gateway
//! - gateway SUCCEEDED: attempt SUCCEEDED, then the shared success path
//! - gateway FAILED: attempt FAILED
//! - gateway still processing: left for the next tick

use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ReconcilerConfig;
use crate::error::{BillingError, BillingResult};
use crate::payment::{
    AttemptUpdate, GatewayError, PaymentAttempt, PaymentGateway, PaymentService, PaymentStatus,
};
use crate::store::{CasOutcome, InvoiceStore, PaymentAttemptStore};

const PRE_FLIGHT_CRASH_CODE: &str = "system_crash_pre_flight";
const PRE_FLIGHT_CRASH_MESSAGE: &str = "Stuck PENDING with no Provider ID (Crash before API call)";

/// What happened to one attempt during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Failed without a gateway call
    FailedPreFlight,
    Succeeded,
    Failed,
    StillPending,
    /// Settled by someone else while this tick ran
    AlreadySettled,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub failed_pre_flight: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub still_pending: usize,
    pub already_settled: usize,
    pub errors: usize,
}

impl ReconcileSummary {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::FailedPreFlight => self.failed_pre_flight += 1,
            Resolution::Succeeded => self.succeeded += 1,
            Resolution::Failed => self.failed += 1,
            Resolution::StillPending => self.still_pending += 1,
            Resolution::AlreadySettled => self.already_settled += 1,
        }
    }
}

pub struct Reconciler {
    attempts: Arc<dyn PaymentAttemptStore>,
    gateway: Arc<dyn PaymentGateway>,
    invoices: Arc<dyn InvoiceStore>,
    payments: Arc<PaymentService>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        attempts: Arc<dyn PaymentAttemptStore>,
        gateway: Arc<dyn PaymentGateway>,
        invoices: Arc<dyn InvoiceStore>,
        payments: Arc<PaymentService>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            attempts,
            gateway,
            invoices,
            payments,
            config,
        }
    }

    /// Tick every `interval` until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            "Reconciler started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        tracing::error!(error = %e, "Reconcile tick failed");
                    }
                }
            }
        }
        tracing::info!("Reconciler stopped");
    }

    /// One scan over stale PENDING attempts
    pub async fn reconcile_once(self: &Arc<Self>) -> BillingResult<ReconcileSummary> {
        let stale_after = time::Duration::try_from(self.config.stale_after)
            .map_err(|e| BillingError::Config(format!("invalid staleness threshold: {e}")))?;
        let cutoff = OffsetDateTime::now_utc() - stale_after;

        let pending = self
            .attempts
            .get_pending_attempts(self.config.batch_size, cutoff)
            .await?;

        let mut summary = ReconcileSummary {
            scanned: pending.len(),
            ..ReconcileSummary::default()
        };
        if pending.is_empty() {
            return Ok(summary);
        }

        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut tasks = JoinSet::new();
        for attempt in pending {
            let permits = Arc::clone(&permits);
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let attempt_id = attempt.id;
                (attempt_id, this.reconcile_attempt(attempt).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(resolution))) => summary.record(resolution),
                Ok((attempt_id, Err(e))) => {
                    summary.errors += 1;
                    tracing::warn!(attempt_id = %attempt_id, error = %e, "Failed to reconcile attempt");
                }
                Err(e) => {
                    summary.errors += 1;
                    tracing::error!(error = %e, "Reconcile task panicked");
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            succeeded = summary.succeeded,
            failed = summary.failed + summary.failed_pre_flight,
            still_pending = summary.still_pending,
            errors = summary.errors,
            "Reconcile tick complete"
        );
        Ok(summary)
    }

    async fn reconcile_attempt(&self, attempt: PaymentAttempt) -> BillingResult<Resolution> {
        let Some(provider_payment_id) = attempt
            .provider_payment_id
            .as_deref()
            .filter(|id| !id.is_empty())
        else {
            let update = AttemptUpdate::failed(PRE_FLIGHT_CRASH_CODE, PRE_FLIGHT_CRASH_MESSAGE);
            return Ok(match self.attempts.update_attempt_status(attempt.id, &update).await? {
                CasOutcome::Applied => {
                    tracing::info!(attempt_id = %attempt.id, "Attempt failed: crashed before gateway call");
                    Resolution::FailedPreFlight
                }
                CasOutcome::Unchanged => Resolution::AlreadySettled,
            });
        };

        let status = match tokio::time::timeout(
            self.config.gateway_timeout,
            self.gateway.get_payment_status(provider_payment_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(BillingError::Gateway(GatewayError::Timeout)),
        };

        match status {
            PaymentStatus::Succeeded => {
                let update = AttemptUpdate::succeeded(provider_payment_id);
                let outcome = self.attempts.update_attempt_status(attempt.id, &update).await?;

                let invoice = self
                    .invoices
                    .get_invoice_by_id(attempt.invoice_id)
                    .await?
                    .ok_or_else(|| BillingError::InvoiceNotFound(attempt.invoice_id.to_string()))?;
                self.payments
                    .finalize_successful_payment(&invoice, provider_payment_id)
                    .await?;

                tracing::info!(
                    attempt_id = %attempt.id,
                    invoice_id = %attempt.invoice_id,
                    provider_payment_id,
                    "Recovered successful payment"
                );
                Ok(match outcome {
                    CasOutcome::Applied => Resolution::Succeeded,
                    CasOutcome::Unchanged => Resolution::AlreadySettled,
                })
            }
            PaymentStatus::Failed => {
                let update = AttemptUpdate::failed("payment_failed", "Reconciled from gateway")
                    .with_provider_id(Some(provider_payment_id.to_string()));
                Ok(match self.attempts.update_attempt_status(attempt.id, &update).await? {
                    CasOutcome::Applied => {
                        tracing::info!(attempt_id = %attempt.id, "Attempt failed at gateway");
                        Resolution::Failed
                    }
                    CasOutcome::Unchanged => Resolution::AlreadySettled,
                })
            }
            other => {
                tracing::debug!(attempt_id = %attempt.id, status = %other, "Attempt still processing");
                Ok(Resolution::StillPending)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::PaymentConfig;
    use crate::invoice::{Invoice, InvoiceStatus};
    use crate::payment::{PaymentRequest, PaymentResult};
    use crate::store::memory::{
        InMemoryAccountStore, InMemoryInvoiceStore, InMemoryLedgerStore,
        InMemoryPaymentAttemptStore,
    };
    use async_trait::async_trait;
    use meterbook_shared::BillingPeriod;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    struct StatusGateway {
        statuses: HashMap<String, PaymentStatus>,
        status_calls: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for StatusGateway {
        fn provider(&self) -> &str {
            "Stripe"
        }

        async fn charge_attempt(&self, _: &PaymentRequest) -> Result<PaymentResult, GatewayError> {
            Err(GatewayError::InvalidRequest("not used".into()))
        }

        async fn get_payment_status(&self, id: &str) -> Result<PaymentStatus, GatewayError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.statuses.get(id).copied().unwrap_or(PaymentStatus::Pending))
        }
    }

    struct Fixture {
        invoices: Arc<InMemoryInvoiceStore>,
        attempts: Arc<InMemoryPaymentAttemptStore>,
        gateway: Arc<StatusGateway>,
        reconciler: Arc<Reconciler>,
    }

    fn fixture(statuses: &[(&str, PaymentStatus)]) -> Fixture {
        let invoices = Arc::new(InMemoryInvoiceStore::new());
        let attempts = Arc::new(InMemoryPaymentAttemptStore::new());
        let gateway = Arc::new(StatusGateway {
            statuses: statuses
                .iter()
                .map(|(id, s)| (id.to_string(), *s))
                .collect(),
            status_calls: AtomicUsize::new(0),
        });
        let payments = Arc::new(PaymentService::new(
            invoices.clone(),
            attempts.clone(),
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryAccountStore::new()),
            gateway.clone(),
            PaymentConfig::default(),
        ));
        let config = ReconcilerConfig {
            stale_after: Duration::from_secs(300),
            ..ReconcilerConfig::default()
        };
        let reconciler = Arc::new(Reconciler::new(
            attempts.clone(),
            gateway.clone(),
            invoices.clone(),
            payments,
            config,
        ));
        Fixture {
            invoices,
            attempts,
            gateway,
            reconciler,
        }
    }

    async fn stale_attempt(f: &Fixture, provider_payment_id: Option<&str>) -> (Invoice, PaymentAttempt) {
        let invoice = Invoice {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            period: BillingPeriod::new(2024, 6).unwrap(),
            total_cents: 600,
            currency: "USD".into(),
            status: InvoiceStatus::Finalized,
            lines: vec![],
            payment_reference: None,
            created_at: OffsetDateTime::now_utc(),
        };
        f.invoices.create_invoice(&invoice).await.unwrap();

        let mut attempt = PaymentAttempt::pending(invoice.id, invoice.tenant_id, "Stripe", 600, "USD");
        attempt.provider_payment_id = provider_payment_id.map(str::to_string);
        attempt.created_at = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        f.attempts.create_payment_attempt(&attempt).await.unwrap();
        (invoice, attempt)
    }

    #[tokio::test]
    async fn test_no_provider_id_fails_without_gateway_call() {
        let f = fixture(&[]);
        let (_, attempt) = stale_attempt(&f, None).await;

        let summary = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.failed_pre_flight, 1);
        assert_eq!(f.gateway.status_calls.load(Ordering::SeqCst), 0);

        let stored = f.attempts.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.error_code.as_deref(), Some(PRE_FLIGHT_CRASH_CODE));
    }

    #[tokio::test]
    async fn test_gateway_success_marks_invoice_paid() {
        let f = fixture(&[("pi_ok", PaymentStatus::Succeeded)]);
        let (invoice, attempt) = stale_attempt(&f, Some("pi_ok")).await;

        let summary = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.succeeded, 1);

        let stored = f.attempts.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Succeeded);
        let invoice = f.invoices.get_invoice_by_id(invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.payment_reference.as_deref(), Some("pi_ok"));
    }

    #[tokio::test]
    async fn test_gateway_failure_and_processing() {
        let f = fixture(&[("pi_bad", PaymentStatus::Failed)]);
        let (_, failed) = stale_attempt(&f, Some("pi_bad")).await;
        let (_, slow) = stale_attempt(&f, Some("pi_slow")).await;

        let summary = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.still_pending, 1);

        let failed = f.attempts.get_attempt(failed.id).await.unwrap().unwrap();
        assert_eq!(failed.status, PaymentStatus::Failed);
        let slow = f.attempts.get_attempt(slow.id).await.unwrap().unwrap();
        assert_eq!(slow.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_fresh_attempts_are_left_alone() {
        let f = fixture(&[]);
        let attempt = PaymentAttempt::pending(Uuid::new_v4(), Uuid::new_v4(), "Stripe", 100, "USD");
        f.attempts.create_payment_attempt(&attempt).await.unwrap();

        let summary = f.reconciler.reconcile_once().await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
    }
}
