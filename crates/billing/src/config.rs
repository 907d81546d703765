//! Runtime configuration for the billing pipeline
//!
//! Everything is read from environment variables with sane defaults:
//! - `USAGE_QUEUE_CAPACITY`, `USAGE_WORKERS`, `USAGE_FLUSH_INTERVAL_SECS`,
//!   `USAGE_FLUSH_MAX_ATTEMPTS`, `USAGE_FLUSH_BACKOFF_MS`, `USAGE_FLUSH_TIMEOUT_SECS`
//! - `PAYMENT_MAX_RETRIES`, `PAYMENT_RETRY_BASE_MS`, `PAYMENT_RETRY_MAX_MS`,
//!   `PAYMENT_JITTER_RATIO`, `PAYMENT_GATEWAY_TIMEOUT_SECS`, `PAYMENT_PROVIDER`,
//!   `PAYMENT_FLOW_TIMEOUT_SECS` (defaults to the retry budget)
//! - `RECONCILE_INTERVAL_SECS`, `RECONCILE_STALE_AFTER_SECS`, `RECONCILE_BATCH_SIZE`,
//!   `RECONCILE_WORKERS`, `RECONCILE_GATEWAY_TIMEOUT_SECS`
//! - `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET` (required when Stripe is the provider)

use std::str::FromStr;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Read an env var, falling back to `default` when unset or unparsable
fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = %default, "Invalid config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn required(key: &str) -> BillingResult<String> {
    std::env::var(key).map_err(|_| BillingError::Config(format!("{key} not set")))
}

/// Usage aggregation settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Bounded queue size; events beyond this are dropped
    pub queue_capacity: usize,
    pub workers: usize,
    pub flush_interval: Duration,
    pub flush_max_attempts: u32,
    /// Linear backoff unit between flush attempts (attempt * backoff)
    pub flush_backoff: Duration,
    /// Deadline for a single store flush call
    pub flush_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            workers: 4,
            flush_interval: Duration::from_secs(30),
            flush_max_attempts: 3,
            flush_backoff: Duration::from_millis(1_000),
            flush_timeout: Duration::from_secs(10),
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_capacity: env_or("USAGE_QUEUE_CAPACITY", d.queue_capacity).max(1),
            workers: env_or("USAGE_WORKERS", d.workers).max(1),
            flush_interval: Duration::from_secs(env_or(
                "USAGE_FLUSH_INTERVAL_SECS",
                d.flush_interval.as_secs(),
            )),
            flush_max_attempts: env_or("USAGE_FLUSH_MAX_ATTEMPTS", d.flush_max_attempts).max(1),
            flush_backoff: Duration::from_millis(env_or(
                "USAGE_FLUSH_BACKOFF_MS",
                d.flush_backoff.as_millis() as u64,
            )),
            flush_timeout: Duration::from_secs(env_or(
                "USAGE_FLUSH_TIMEOUT_SECS",
                d.flush_timeout.as_secs(),
            )),
        }
    }
}

/// Payment collection settings
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Retries after the first gateway call
    pub max_retries: usize,
    pub retry_base: Duration,
    pub retry_max: Duration,
    /// Fraction of the computed backoff added or removed at random
    pub jitter_ratio: f64,
    /// Hard deadline for one gateway call
    pub gateway_timeout: Duration,
    /// Deadline for the whole coalesced payment flow. Must cover
    /// [`PaymentConfig::retry_budget`] or retries are cut off mid-schedule.
    pub flow_timeout: Duration,
    pub provider: String,
}

/// Headroom on top of the retry schedule for the store writes around it
const FLOW_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(200),
            retry_max: Duration::from_millis(2_000),
            jitter_ratio: 0.2,
            gateway_timeout: Duration::from_secs(30),
            flow_timeout: Duration::ZERO,
            provider: "stripe".to_string(),
        }
        .with_budgeted_flow_timeout()
    }
}

impl PaymentConfig {
    /// Worst-case duration of one payment flow: every gateway call runs into
    /// its timeout and every backoff lands on the jittered cap.
    pub fn retry_budget(&self) -> Duration {
        let retries = u32::try_from(self.max_retries).unwrap_or(u32::MAX);
        let calls = self.gateway_timeout.saturating_mul(retries.saturating_add(1));
        let longest_backoff =
            Duration::try_from_secs_f64(self.retry_max.as_secs_f64() * (1.0 + self.jitter_ratio))
                .unwrap_or(Duration::MAX);
        calls
            .saturating_add(longest_backoff.saturating_mul(retries))
            .saturating_add(FLOW_TIMEOUT_MARGIN)
    }

    /// Set `flow_timeout` to the current retry budget
    pub fn with_budgeted_flow_timeout(mut self) -> Self {
        self.flow_timeout = self.retry_budget();
        self
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        let config = Self {
            max_retries: env_or("PAYMENT_MAX_RETRIES", d.max_retries),
            retry_base: Duration::from_millis(env_or(
                "PAYMENT_RETRY_BASE_MS",
                d.retry_base.as_millis() as u64,
            )),
            retry_max: Duration::from_millis(env_or(
                "PAYMENT_RETRY_MAX_MS",
                d.retry_max.as_millis() as u64,
            )),
            jitter_ratio: env_or("PAYMENT_JITTER_RATIO", d.jitter_ratio).clamp(0.0, 1.0),
            gateway_timeout: Duration::from_secs(env_or(
                "PAYMENT_GATEWAY_TIMEOUT_SECS",
                d.gateway_timeout.as_secs(),
            )),
            flow_timeout: Duration::ZERO,
            provider: std::env::var("PAYMENT_PROVIDER")
                .map(|p| p.to_lowercase())
                .unwrap_or(d.provider),
        }
        .with_budgeted_flow_timeout();

        match std::env::var("PAYMENT_FLOW_TIMEOUT_SECS") {
            Ok(_) => {
                let flow_timeout = Duration::from_secs(env_or(
                    "PAYMENT_FLOW_TIMEOUT_SECS",
                    config.flow_timeout.as_secs(),
                ));
                if flow_timeout < config.retry_budget() {
                    tracing::warn!(
                        flow_timeout_secs = flow_timeout.as_secs(),
                        retry_budget_secs = config.retry_budget().as_secs(),
                        "PAYMENT_FLOW_TIMEOUT_SECS is shorter than the retry schedule"
                    );
                }
                Self {
                    flow_timeout,
                    ..config
                }
            }
            Err(_) => config,
        }
    }
}

/// Reconciler settings
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// PENDING attempts younger than this are left alone
    pub stale_after: Duration,
    pub batch_size: i64,
    pub workers: usize,
    /// Deadline for one gateway status check
    pub gateway_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
            batch_size: 50,
            workers: 5,
            gateway_timeout: Duration::from_secs(30),
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            interval: Duration::from_secs(env_or("RECONCILE_INTERVAL_SECS", d.interval.as_secs())),
            stale_after: Duration::from_secs(env_or(
                "RECONCILE_STALE_AFTER_SECS",
                d.stale_after.as_secs(),
            )),
            batch_size: env_or("RECONCILE_BATCH_SIZE", d.batch_size).max(1),
            workers: env_or("RECONCILE_WORKERS", d.workers).max(1),
            gateway_timeout: Duration::from_secs(env_or(
                "RECONCILE_GATEWAY_TIMEOUT_SECS",
                d.gateway_timeout.as_secs(),
            )),
        }
    }
}

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
        })
    }
}
