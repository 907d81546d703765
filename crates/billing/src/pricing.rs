//! Tiered pricing and price rules
//!
//! A tier list is ordered by cumulative upper bound: `[{up_to: 100, ..}, {up_to: None, ..}]`
//! bills the first 100 units at the first tier's rate and everything after at the second.
//! Only the last tier may be unlimited.

use meterbook_shared::UsageType;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One pricing band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    /// Cumulative upper bound of this band; `None` means unlimited
    pub up_to: Option<i64>,
    pub unit_cost_cents: i64,
    /// Charged once when usage enters this band
    #[serde(default)]
    pub flat_fee_cents: i64,
}

impl Tier {
    pub fn up_to(limit: i64, unit_cost_cents: i64) -> Self {
        Self {
            up_to: Some(limit),
            unit_cost_cents,
            flat_fee_cents: 0,
        }
    }

    pub fn unlimited(unit_cost_cents: i64) -> Self {
        Self {
            up_to: None,
            unit_cost_cents,
            flat_fee_cents: 0,
        }
    }

    pub fn with_flat_fee(mut self, flat_fee_cents: i64) -> Self {
        self.flat_fee_cents = flat_fee_cents;
        self
    }
}

/// Pricing rule for a usage type, optionally scoped to a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceRule {
    pub id: Uuid,
    /// `None` is the default rule for every tenant
    pub tenant_id: Option<Uuid>,
    pub usage_type: UsageType,
    pub unit_price_cents: i64,
    pub currency: String,
    /// When present, cost comes from the tiers and `unit_price_cents` is ignored
    pub tiers: Option<Vec<Tier>>,
    pub effective_from: OffsetDateTime,
    pub effective_to: Option<OffsetDateTime>,
}

impl PriceRule {
    /// Whether the rule is in force at `at` (`effective_from <= at < effective_to`)
    pub fn applies_at(&self, at: OffsetDateTime) -> bool {
        self.effective_from <= at && self.effective_to.map_or(true, |end| at < end)
    }
}

/// Stateless cost calculator over a validated tier list
#[derive(Debug, Clone)]
pub struct PricingEngine {
    tiers: Vec<Tier>,
}

impl PricingEngine {
    pub fn new(tiers: Vec<Tier>) -> BillingResult<Self> {
        Self::validate_tiers(&tiers)?;
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[Tier] {
        &self.tiers
    }

    /// Check ordering, bounds and costs of a tier list
    pub fn validate_tiers(tiers: &[Tier]) -> BillingResult<()> {
        if tiers.is_empty() {
            return Err(BillingError::InvalidTiers("at least one tier is required".into()));
        }

        let mut previous: i64 = 0;
        for (i, tier) in tiers.iter().enumerate() {
            let is_last = i == tiers.len() - 1;

            if tier.unit_cost_cents < 0 || tier.flat_fee_cents < 0 {
                return Err(BillingError::InvalidTiers(format!(
                    "tier {i} has a negative cost"
                )));
            }

            match tier.up_to {
                None if !is_last => {
                    return Err(BillingError::InvalidTiers(format!(
                        "tier {i} is unlimited but is not the last tier"
                    )));
                }
                None => {}
                Some(_) if is_last => {
                    return Err(BillingError::InvalidTiers(
                        "the last tier must be unlimited".into(),
                    ));
                }
                Some(limit) => {
                    if limit <= previous {
                        return Err(BillingError::InvalidTiers(format!(
                            "tier {i} upper bound {limit} must be greater than {previous}"
                        )));
                    }
                    previous = limit;
                }
            }
        }
        Ok(())
    }

    /// Cost of `usage` units starting from zero
    pub fn calculate_cost(&self, usage: i64) -> BillingResult<i64> {
        self.calculate_cost_range(0, usage)
    }

    /// Cost of the units in `[from, to)`.
    ///
    /// A tier's flat fee is charged only by the range that contains the tier's
    /// first unit, so adjoining ranges always sum to the cost of their union.
    pub fn calculate_cost_range(&self, from: i64, to: i64) -> BillingResult<i64> {
        if from < 0 {
            return Err(BillingError::NegativeUsage(from));
        }
        if to < from {
            return Err(BillingError::NegativeUsage(to - from));
        }

        let overflow = || BillingError::Integrity("cost overflows i64".into());
        let mut cost: i64 = 0;
        let mut allocated: i64 = 0;
        let mut lower: i64 = 0;

        for tier in &self.tiers {
            let upper = tier.up_to.unwrap_or(i64::MAX);
            let start = from.max(lower);
            let end = to.min(upper);

            if end > start {
                let units = end - start;
                let band = tier.unit_cost_cents.checked_mul(units).ok_or_else(overflow)?;
                cost = cost.checked_add(band).ok_or_else(overflow)?;
                if start == lower {
                    cost = cost.checked_add(tier.flat_fee_cents).ok_or_else(overflow)?;
                }
                allocated += units;
            }

            if upper >= to {
                break;
            }
            lower = upper;
        }

        if allocated != to - from {
            return Err(BillingError::Integrity(format!(
                "tiers allocated {allocated} of {} units",
                to - from
            )));
        }
        Ok(cost)
    }
}
