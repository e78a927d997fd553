//! Equity tier limiter.
//!
//! Caps how many orders a subaccount may have open based on its net
//! collateral. Short-term and stateful orders have independent tier tables.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use clob_core::{InvariantViolation, Order, RejectReason};

use crate::error::{RiskError, RiskResult};

/// One row of a tier table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityTier {
    /// Lowest net collateral (quote quantums) this tier applies to.
    #[serde(with = "wide_int")]
    pub min_net_collateral: i128,
    pub max_orders: u32,
}

impl EquityTier {
    pub fn new(min_net_collateral: i128, max_orders: u32) -> Self {
        Self {
            min_net_collateral,
            max_orders,
        }
    }
}

/// Tier tables, ascending by `min_net_collateral`.
///
/// An empty table means "unlimited".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquityTierLimitConfiguration {
    pub short_term: Vec<EquityTier>,
    pub stateful: Vec<EquityTier>,
}

impl EquityTierLimitConfiguration {
    /// Thresholds must be strictly ascending in both tables.
    pub fn validate(&self) -> RiskResult<()> {
        for (name, tiers) in [("short_term", &self.short_term), ("stateful", &self.stateful)] {
            for pair in tiers.windows(2) {
                if pair[0].min_net_collateral >= pair[1].min_net_collateral {
                    return Err(RiskError::ConfigError(format!(
                        "{name} equity tiers must be strictly ascending: {} then {}",
                        pair[0].min_net_collateral, pair[1].min_net_collateral
                    )));
                }
            }
        }
        Ok(())
    }

    fn tiers_for(&self, order: &Order) -> &[EquityTier] {
        if order.is_stateful() {
            &self.stateful
        } else {
            &self.short_term
        }
    }

    /// Highest tier reached by `net_collateral`, if any.
    pub fn tier_for(tiers: &[EquityTier], net_collateral: i128) -> Option<&EquityTier> {
        tiers
            .iter()
            .take_while(|t| t.min_net_collateral <= net_collateral)
            .last()
    }

    /// Decide whether `order` may be admitted given the subaccount's collateral
    /// and the number of orders it already has open.
    ///
    /// # Returns
    /// - `Ok(())` if the order is allowed
    /// - `Err(RiskError::Rejected(EquityTierLimitExceeded))` past the tier limit
    /// - `Err(RiskError::Invariant(NegativeOpenCount))` on a negative count
    pub fn check_admission(
        &self,
        order: &Order,
        net_collateral: i128,
        open_count: i64,
    ) -> RiskResult<()> {
        if !order.is_stateful() && order.time_in_force.never_rests() {
            return Ok(());
        }
        if open_count < 0 {
            return Err(InvariantViolation::NegativeOpenCount {
                subaccount: order.subaccount_id().clone(),
                count: open_count,
            }
            .into());
        }

        let tiers = self.tiers_for(order);
        let limit = match Self::tier_for(tiers, net_collateral) {
            Some(tier) => tier.max_orders,
            None if tiers.is_empty() => return Ok(()),
            None => 0,
        };

        if open_count + 1 > i64::from(limit) {
            debug!(
                order_id = %order.order_id,
                net_collateral,
                open_count,
                limit,
                "Equity tier limit blocked"
            );
            return Err(RejectReason::EquityTierLimitExceeded {
                limit,
                open: open_count,
            }
            .into());
        }

        trace!(
            order_id = %order.order_id,
            open_count,
            limit,
            "Equity tier limit passed"
        );
        Ok(())
    }
}

/// TOML integers are 64-bit; wider values round-trip as strings.
mod wide_int {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i128, serializer: S) -> Result<S::Ok, S::Error> {
        match i64::try_from(*value) {
            Ok(narrow) => serializer.serialize_i64(narrow),
            Err(_) => serializer.serialize_str(&value.to_string()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Int(n) => Ok(i128::from(n)),
            Raw::Str(s) => s.parse().map_err(D::Error::custom),
        }
    }
}
