use meterbook_shared::{BillingPeriod, UsageType};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// A single metered occurrence, as reported by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub usage_type: UsageType,
    pub quantity: i64,
    pub timestamp: OffsetDateTime,
}

impl UsageEvent {
    pub fn new(tenant_id: Uuid, usage_type: UsageType, quantity: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            usage_type,
            quantity,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Aggregated usage for one tenant, usage type and period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub tenant_id: Uuid,
    pub usage_type: UsageType,
    pub total_quantity: i64,
    pub period: BillingPeriod,
}

/// Deltas written by one flush. Applied at most once per `batch_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushBatch {
    pub batch_id: Uuid,
    pub records: Vec<UsageRecord>,
}
