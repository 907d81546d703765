//! Common billing types used across Meterbook

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::{Date, Month, OffsetDateTime, Time};

use crate::error::DomainError;

// =============================================================================
// Usage Types
// =============================================================================

/// Kind of metered usage a tenant is billed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    ShipmentCreated,
    ApiRequest,
}

impl UsageType {
    pub const ALL: [UsageType; 2] = [UsageType::ShipmentCreated, UsageType::ApiRequest];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::ShipmentCreated => "SHIPMENT_CREATED",
            UsageType::ApiRequest => "API_REQUEST",
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHIPMENT_CREATED" => Ok(UsageType::ShipmentCreated),
            "API_REQUEST" => Ok(UsageType::ApiRequest),
            other => Err(DomainError::UnknownUsageType(other.to_string())),
        }
    }
}

// =============================================================================
// Ledger Transaction Types
// =============================================================================

/// Direction of a ledger movement
///
/// DEBIT: the tenant owes us. CREDIT: we owe the tenant (adjustments).
/// PAYMENT: money collected against an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Debit,
    Credit,
    Payment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "DEBIT",
            TransactionType::Credit => "CREDIT",
            TransactionType::Payment => "PAYMENT",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEBIT" => Ok(TransactionType::Debit),
            "CREDIT" => Ok(TransactionType::Credit),
            "PAYMENT" => Ok(TransactionType::Payment),
            other => Err(DomainError::UnknownTransactionType(other.to_string())),
        }
    }
}

// =============================================================================
// Billing Period
// =============================================================================

/// A calendar month that usage, ledger entries and invoices are grouped by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawBillingPeriod")]
pub struct BillingPeriod {
    year: i32,
    month: u8,
}

/// Unchecked wire shape; deserialization goes through [`BillingPeriod::new`]
#[derive(Deserialize)]
struct RawBillingPeriod {
    year: i32,
    month: u8,
}

impl TryFrom<RawBillingPeriod> for BillingPeriod {
    type Error = DomainError;

    fn try_from(raw: RawBillingPeriod) -> Result<Self, Self::Error> {
        Self::new(raw.year, raw.month)
    }
}

impl BillingPeriod {
    pub fn new(year: i32, month: u8) -> Result<Self, DomainError> {
        if !(1..=12).contains(&month) || !(1970..=9999).contains(&year) {
            return Err(DomainError::InvalidBillingPeriod { year, month });
        }
        Ok(Self { year, month })
    }

    /// The period a timestamp falls in (UTC)
    pub fn containing(at: OffsetDateTime) -> Self {
        let at = at.to_offset(time::UtcOffset::UTC);
        Self {
            year: at.year(),
            month: u8::from(at.month()),
        }
    }

    pub fn current() -> Self {
        Self::containing(OffsetDateTime::now_utc())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// First instant of the period, midnight UTC on the 1st.
    /// Prices are looked up as of this instant.
    pub fn start(&self) -> Result<OffsetDateTime, DomainError> {
        let invalid = || DomainError::InvalidBillingPeriod {
            year: self.year,
            month: self.month,
        };
        let month = Month::try_from(self.month).map_err(|_| invalid())?;
        let date = Date::from_calendar_date(self.year, month, 1).map_err(|_| invalid())?;
        Ok(date.with_time(Time::MIDNIGHT).assume_utc())
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

// =============================================================================
// Currency
// =============================================================================

/// Normalize an ISO-4217 currency code to upper case ("usd" -> "USD")
pub fn normalize_currency(code: &str) -> Result<String, DomainError> {
    let trimmed = code.trim();
    if trimmed.len() != 3 || !trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(DomainError::InvalidCurrency(code.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}
