//! Meterbook Billing Library
//!
//! Usage metering, pricing, the ledger, invoices and payment collection for
//! multi-tenant metered billing.
//!
//! Pipeline, in order:
//! 1. [`UsageAggregator`] batches usage events and flushes them to a [`store::UsageStore`]
//! 2. [`BillingCalculator`] prices a period's usage into idempotent ledger entries
//! 3. [`InvoiceGenerator`] builds a DRAFT invoice from the ledger and
//!    [`InvoiceFinalizer`] locks it
//! 4. [`PaymentService`] charges it once, and the [`Reconciler`] repairs attempts
//!    left behind by crashes

pub mod calculator;
pub mod config;
pub mod error;
pub mod invoice;
pub mod ledger;
pub mod payment;
pub mod pricing;
pub mod reconciler;
pub mod store;
pub mod usage;

pub use calculator::{BillingCalculator, BillingRunSummary};
pub use config::{AggregatorConfig, PaymentConfig, ReconcilerConfig, StripeConfig};
pub use error::{BillingError, BillingResult};
pub use invoice::{Invoice, InvoiceFinalizer, InvoiceGenerator, InvoiceLine, InvoiceStatus};
pub use ledger::LedgerEntry;
pub use payment::{
    NormalizedPaymentEvent, PaymentGateway, PaymentOutcome, PaymentService, StripeGateway,
    StripeWebhookVerifier,
};
pub use pricing::{PriceRule, PricingEngine, Tier};
pub use reconciler::{ReconcileSummary, Reconciler};
pub use usage::{UsageAggregator, UsageEvent};
