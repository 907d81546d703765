//! Meterbook background worker
//!
//! Runs usage aggregation, the payment reconciler and the monthly billing
//! cycle until SIGINT/SIGTERM.

mod billing_cycle;

use std::sync::Arc;

use anyhow::{anyhow, Context};
use meterbook_billing::store::postgres::{
    PgAccountStore, PgInvoiceStore, PgLedgerStore, PgPaymentAttemptStore, PgPricingStore,
    PgUsageStore,
};
use meterbook_billing::{
    AggregatorConfig, BillingCalculator, InvoiceFinalizer, InvoiceGenerator, PaymentConfig,
    PaymentService, ReconcilerConfig, Reconciler, StripeConfig, StripeGateway, UsageAggregator,
};
use meterbook_shared::{create_pool, run_migrations, DatabaseConfig};
use tokio::signal;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::billing_cycle::BillingCycle;

/// 02:00 UTC on the first of every month (sec min hour day month weekday)
const DEFAULT_BILLING_CRON: &str = "0 0 2 1 * *";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meterbook_billing=debug,meterbook_worker=debug"));
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting meterbook-worker");

    let db_config = DatabaseConfig::from_env().ok_or_else(|| anyhow!("DATABASE_URL not set"))?;
    let pool = create_pool(&db_config)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let usage = Arc::new(PgUsageStore::new(pool.clone()));
    let pricing = Arc::new(PgPricingStore::new(pool.clone()));
    let ledger = Arc::new(PgLedgerStore::new(pool.clone()));
    let invoices = Arc::new(PgInvoiceStore::new(pool.clone()));
    let attempts = Arc::new(PgPaymentAttemptStore::new(pool.clone()));
    let accounts = Arc::new(PgAccountStore::new(pool.clone()));

    let payment_config = PaymentConfig::from_env();
    if payment_config.provider != "stripe" {
        return Err(anyhow!("Unsupported payment provider: {}", payment_config.provider));
    }
    let stripe_config = StripeConfig::from_env()?;
    let gateway = Arc::new(StripeGateway::new(&stripe_config));

    let shutdown = CancellationToken::new();

    let payments = Arc::new(
        PaymentService::new(
            invoices.clone(),
            attempts.clone(),
            ledger.clone(),
            accounts,
            gateway.clone(),
            payment_config,
        )
        .with_shutdown(shutdown.clone()),
    );

    // Nothing in this binary produces usage events. Services that embed
    // meterbook-billing run their own aggregator and ingest through it.
    let aggregator = Arc::new(UsageAggregator::new(AggregatorConfig::from_env(), usage.clone()));
    aggregator.start();
    tracing::info!(
        "Usage aggregator started with no ingestion source in this process; \
         usage is ingested by services embedding meterbook-billing"
    );

    let reconciler = Arc::new(Reconciler::new(
        attempts,
        gateway,
        invoices.clone(),
        payments.clone(),
        ReconcilerConfig::from_env(),
    ));
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown.clone()));

    let cycle = Arc::new(BillingCycle::new(
        BillingCalculator::new(usage, pricing, ledger.clone()),
        InvoiceGenerator::new(ledger, invoices.clone()),
        InvoiceFinalizer::new(invoices.clone()),
        invoices,
        payments,
    ));

    let schedule =
        std::env::var("BILLING_CRON").unwrap_or_else(|_| DEFAULT_BILLING_CRON.to_string());
    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("Failed to create scheduler: {e:?}"))?;
    let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let cycle = Arc::clone(&cycle);
        Box::pin(async move {
            if let Err(e) = cycle.run_previous_month().await {
                tracing::error!(error = %e, "Billing cycle aborted");
            }
        })
    })
    .map_err(|e| anyhow!("Invalid BILLING_CRON {schedule:?}: {e:?}"))?;
    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow!("Failed to schedule billing cycle: {e:?}"))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("Failed to start scheduler: {e:?}"))?;

    tracing::info!(billing_cron = %schedule, "Worker running");

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = ?e, "Scheduler did not shut down cleanly");
    }
    if let Err(e) = reconciler_handle.await {
        tracing::warn!(error = %e, "Reconciler task panicked");
    }

    match aggregator.stop().await {
        Ok(Some(flush)) => tracing::info!(records = flush.records, "Final usage flush written"),
        Ok(None) => tracing::info!("No pending usage at shutdown"),
        Err(e) => tracing::error!(error = %e, "Final usage flush failed, buffered usage lost"),
    }

    pool.close().await;
    tracing::info!("Worker stopped");
    Ok(())
}
