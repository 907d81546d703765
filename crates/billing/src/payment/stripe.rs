//! Stripe implementation of the payment gateway

use async_trait::async_trait;
use stripe::{
    Client, CreatePaymentIntent, Currency, CustomerId, PaymentIntent, PaymentIntentId,
    PaymentIntentStatus, PaymentMethodId, RequestStrategy, StripeError,
};

use super::gateway::{GatewayError, NetworkErrorKind, PaymentGateway};
use super::models::{PaymentRequest, PaymentResult, PaymentStatus};
use crate::config::StripeConfig;

/// Provider name recorded on payment attempts
pub const STRIPE_PROVIDER: &str = "Stripe";

/// Off-session charges through Stripe PaymentIntents
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
}

impl StripeGateway {
    pub fn new(config: &StripeConfig) -> Self {
        Self {
            client: Client::new(&config.secret_key),
        }
    }

    /// Client whose writes carry `key` as Stripe's `Idempotency-Key`
    fn idempotent_client(&self, key: String) -> Client {
        self.client
            .clone()
            .with_strategy(RequestStrategy::Idempotent(key))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> &str {
        STRIPE_PROVIDER
    }

    async fn charge_attempt(&self, request: &PaymentRequest) -> Result<PaymentResult, GatewayError> {
        validate_request(request)?;

        let currency = parse_currency(&request.currency)?;
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid customer ID: {e}")))?;
        let payment_method_id = request
            .payment_method_id
            .parse::<PaymentMethodId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid payment method ID: {e}")))?;

        let mut params = CreatePaymentIntent::new(request.amount_cents, currency);
        params.customer = Some(customer_id);
        params.payment_method = Some(payment_method_id);
        params.confirm = Some(true);
        params.error_on_requires_action = Some(true);
        params.description = Some(&request.description);
        params.metadata = Some(request.metadata());

        let client = self.idempotent_client(request.attempt_id.to_string());
        let intent = PaymentIntent::create(&client, params)
            .await
            .map_err(map_stripe_error)?;

        let provider_payment_id = intent.id.to_string();
        tracing::debug!(
            attempt_id = %request.attempt_id,
            payment_intent = %provider_payment_id,
            status = ?intent.status,
            "PaymentIntent created"
        );

        match intent.status {
            PaymentIntentStatus::RequiresAction => Err(GatewayError::RequiresAction {
                payment_id: provider_payment_id,
            }),
            PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::Canceled => {
                let (code, message) = intent
                    .last_payment_error
                    .as_ref()
                    .map(|e| {
                        (
                            e.code.as_ref().and_then(error_code_str),
                            e.message.clone().unwrap_or_default(),
                        )
                    })
                    .unwrap_or_default();
                Err(GatewayError::Provider {
                    status: 402,
                    code,
                    message,
                    payment_id: Some(provider_payment_id),
                })
            }
            status => Ok(PaymentResult {
                provider_payment_id,
                status: map_intent_status(status),
            }),
        }
    }

    async fn get_payment_status(&self, provider_payment_id: &str) -> Result<PaymentStatus, GatewayError> {
        let id = provider_payment_id
            .parse::<PaymentIntentId>()
            .map_err(|e| GatewayError::InvalidRequest(format!("Invalid payment intent ID: {e}")))?;

        let intent = PaymentIntent::retrieve(&self.client, &id, &[])
            .await
            .map_err(map_stripe_error)?;
        Ok(map_intent_status(intent.status))
    }
}

fn validate_request(request: &PaymentRequest) -> Result<(), GatewayError> {
    if request.amount_cents <= 0 {
        return Err(GatewayError::InvalidRequest(format!(
            "amount must be positive, got {}",
            request.amount_cents
        )));
    }
    if request.customer_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("missing customer ID".to_string()));
    }
    if request.payment_method_id.trim().is_empty() {
        return Err(GatewayError::InvalidRequest("missing payment method".to_string()));
    }
    Ok(())
}

fn parse_currency(code: &str) -> Result<Currency, GatewayError> {
    serde_json::from_value(serde_json::Value::String(code.to_ascii_lowercase()))
        .map_err(|_| GatewayError::InvalidRequest(format!("unsupported currency {code}")))
}

/// Stripe's snake_case code, e.g. `card_declined`
fn error_code_str<C: serde::Serialize>(code: &C) -> Option<String> {
    match serde_json::to_value(code) {
        Ok(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

fn map_intent_status(status: PaymentIntentStatus) -> PaymentStatus {
    match status {
        PaymentIntentStatus::Succeeded => PaymentStatus::Succeeded,
        PaymentIntentStatus::RequiresPaymentMethod | PaymentIntentStatus::Canceled => {
            PaymentStatus::Failed
        }
        PaymentIntentStatus::RequiresAction => PaymentStatus::RequiresAction,
        _ => PaymentStatus::Pending,
    }
}

fn map_stripe_error(err: StripeError) -> GatewayError {
    match err {
        StripeError::Stripe(request_error) => GatewayError::Provider {
            status: request_error.http_status,
            code: request_error.code.as_ref().and_then(error_code_str),
            message: request_error.message.unwrap_or_default(),
            payment_id: None,
        },
        StripeError::Timeout => GatewayError::Timeout,
        StripeError::ClientError(message) => GatewayError::Network {
            kind: classify_network_error(&message),
            message,
        },
        other => GatewayError::InvalidRequest(other.to_string()),
    }
}

fn classify_network_error(message: &str) -> NetworkErrorKind {
    let message = message.to_ascii_lowercase();
    if message.contains("refused") {
        NetworkErrorKind::ConnectionRefused
    } else if message.contains("reset") || message.contains("closed") {
        NetworkErrorKind::ConnectionReset
    } else if message.contains("timed out")
        || message.contains("temporar")
        || message.contains("dns")
        || message.contains("unavailable")
    {
        NetworkErrorKind::Temporary
    } else {
        NetworkErrorKind::Other
    }
}
