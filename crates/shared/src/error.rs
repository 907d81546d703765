//! Error types for the shared billing vocabulary

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Unknown usage type: {0}")]
    UnknownUsageType(String),

    #[error("Unknown transaction type: {0}")]
    UnknownTransactionType(String),

    #[error("Invalid billing period: {year}-{month:02}")]
    InvalidBillingPeriod { year: i32, month: u8 },

    #[error("Invalid currency code: {0:?}")]
    InvalidCurrency(String),
}
