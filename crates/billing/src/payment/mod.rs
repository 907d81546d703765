//! Payment collection for finalized invoices

pub mod gateway;
pub mod models;
pub mod retry;
mod service;
pub mod singleflight;
pub mod stripe;
pub mod webhook;

pub use gateway::{GatewayError, NetworkErrorKind, PaymentGateway};
pub use models::{
    AttemptUpdate, BillingAccount, PaymentAttempt, PaymentOutcome, PaymentRequest, PaymentResult,
    PaymentStatus, ZERO_AMOUNT_REFERENCE,
};
pub use retry::RetryPolicy;
pub use service::PaymentService;
pub use self::stripe::{StripeGateway, STRIPE_PROVIDER};
pub use webhook::{NormalizedPaymentEvent, StripeWebhookVerifier};
