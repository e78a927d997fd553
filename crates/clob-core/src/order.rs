//! Order types.
//!
//! An `Order` carries everything the lifecycle engine needs: identity, side,
//! size, limit price, time-in-force, expiration, and the optional conditional
//! or TWAP parameters that decide which subsystem owns it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::admission::InvariantViolation;
use crate::error::{CoreError, Result};
use crate::ids::{ClobPairId, OrderFlavor, OrderId, SubaccountId};
use crate::quantums::{BaseQuantums, Subticks};

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Time-in-force for orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Rests until filled, cancelled, or expired.
    #[default]
    #[serde(rename = "Gtc")]
    GoodTilCancel,
    #[serde(rename = "Ioc")]
    ImmediateOrCancel,
    #[serde(rename = "Fok")]
    FillOrKill,
    #[serde(rename = "PostOnly")]
    PostOnly,
}

impl TimeInForce {
    /// IOC and FOK orders never rest on the book.
    #[inline]
    pub fn never_rests(&self) -> bool {
        matches!(self, Self::ImmediateOrCancel | Self::FillOrKill)
    }
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GoodTilCancel => write!(f, "Gtc"),
            Self::ImmediateOrCancel => write!(f, "Ioc"),
            Self::FillOrKill => write!(f, "Fok"),
            Self::PostOnly => write!(f, "PostOnly"),
        }
    }
}

/// Order expiration.
///
/// Short-term orders expire by block height, everything else by block time
/// (whole seconds, which is also the resolution of expiration buckets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoodTil {
    Block(u32),
    Time(#[serde(with = "chrono::serde::ts_seconds")] DateTime<Utc>),
}

/// Conditional order polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    TakeProfit,
    StopLoss,
}

/// Which oracle movement fires a conditional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerDirection {
    /// Fires when oracle price <= trigger price.
    Lte,
    /// Fires when oracle price >= trigger price.
    Gte,
}

impl TriggerDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lte => "lte",
            Self::Gte => "gte",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionalParams {
    pub kind: ConditionKind,
    pub trigger_subticks: Subticks,
}

/// Time-weighted parent parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TwapParams {
    pub duration_secs: u32,
    pub interval_secs: u32,
    /// Allowed slippage of each leg from the parent limit price.
    pub price_tolerance_ppm: u32,
}

/// A full order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub side: Side,
    pub quantums: BaseQuantums,
    pub subticks: Subticks,
    pub time_in_force: TimeInForce,
    pub good_til: GoodTil,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub conditional: Option<ConditionalParams>,
    #[serde(default)]
    pub twap: Option<TwapParams>,
}

impl Order {
    #[inline]
    pub fn flavor(&self) -> OrderFlavor {
        self.order_id.flavor
    }

    #[inline]
    pub fn subaccount_id(&self) -> &SubaccountId {
        &self.order_id.subaccount_id
    }

    #[inline]
    pub fn clob_pair_id(&self) -> ClobPairId {
        self.order_id.clob_pair_id
    }

    #[inline]
    pub fn is_buy(&self) -> bool {
        self.side == Side::Buy
    }

    #[inline]
    pub fn is_stateful(&self) -> bool {
        self.order_id.is_stateful()
    }

    /// Contract check for stateful-only code paths.
    pub fn must_be_stateful(&self) -> std::result::Result<(), InvariantViolation> {
        if !self.is_stateful() {
            return Err(InvariantViolation::NotStateful(self.order_id.clone()));
        }
        Ok(())
    }

    /// Contract check for conditional-only code paths.
    pub fn must_be_conditional(&self) -> std::result::Result<(), InvariantViolation> {
        if !self.order_id.is_conditional() || self.conditional.is_none() {
            return Err(InvariantViolation::NotConditional(self.order_id.clone()));
        }
        Ok(())
    }

    /// Expiration instant of a stateful order.
    pub fn good_til_time(&self) -> Option<DateTime<Utc>> {
        match self.good_til {
            GoodTil::Time(t) => Some(t),
            GoodTil::Block(_) => None,
        }
    }

    /// Trigger direction of a conditional order.
    ///
    /// Take-profit buys and stop-loss sells fire on a falling price;
    /// take-profit sells and stop-loss buys on a rising one.
    pub fn trigger_direction(&self) -> Option<TriggerDirection> {
        let params = self.conditional?;
        let direction = match (params.kind, self.side) {
            (ConditionKind::TakeProfit, Side::Buy) | (ConditionKind::StopLoss, Side::Sell) => {
                TriggerDirection::Lte
            }
            (ConditionKind::TakeProfit, Side::Sell) | (ConditionKind::StopLoss, Side::Buy) => {
                TriggerDirection::Gte
            }
        };
        Some(direction)
    }

    /// Whether a conditional order fires at an already-rounded oracle price.
    pub fn can_trigger(&self, oracle: Subticks) -> bool {
        match (self.trigger_direction(), self.conditional) {
            (Some(TriggerDirection::Lte), Some(p)) => oracle <= p.trigger_subticks,
            (Some(TriggerDirection::Gte), Some(p)) => oracle >= p.trigger_subticks,
            _ => false,
        }
    }

    /// Structural validation performed before an order enters the pipeline.
    pub fn validate(&self) -> Result<()> {
        self.order_id.subaccount_id.validate()?;
        if self.quantums.is_zero() {
            return Err(CoreError::InvalidOrder("quantums must be positive".to_string()));
        }
        if self.subticks == Subticks::ZERO {
            return Err(CoreError::InvalidOrder("subticks must be positive".to_string()));
        }
        match (self.flavor(), self.good_til) {
            (OrderFlavor::ShortTerm, GoodTil::Block(_)) => {}
            (OrderFlavor::ShortTerm, GoodTil::Time(_)) => {
                return Err(CoreError::InvalidOrder(
                    "short-term orders expire by block height".to_string(),
                ))
            }
            (_, GoodTil::Block(_)) => {
                return Err(CoreError::InvalidOrder(
                    "stateful orders expire by block time".to_string(),
                ))
            }
            (_, GoodTil::Time(_)) => {}
        }
        if self.order_id.is_conditional() != self.conditional.is_some() {
            return Err(CoreError::InvalidOrder(
                "conditional params must be set exactly for conditional orders".to_string(),
            ));
        }
        if (self.flavor() == OrderFlavor::TwapParent) != self.twap.is_some() {
            return Err(CoreError::InvalidOrder(
                "twap params must be set exactly for twap parents".to_string(),
            ));
        }
        if let Some(twap) = self.twap {
            if twap.interval_secs == 0 {
                return Err(CoreError::InvalidOrder("twap interval must be positive".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conditional(side: Side, kind: ConditionKind, trigger: u64) -> Order {
        Order {
            order_id: OrderId::new(
                SubaccountId::new("alice", 0),
                1,
                ClobPairId(0),
                OrderFlavor::Conditional,
            ),
            side,
            quantums: BaseQuantums(10),
            subticks: Subticks(20),
            time_in_force: TimeInForce::GoodTilCancel,
            good_til: GoodTil::Time(Utc.timestamp_opt(100, 0).unwrap()),
            reduce_only: false,
            conditional: Some(ConditionalParams {
                kind,
                trigger_subticks: Subticks(trigger),
            }),
            twap: None,
        }
    }

    #[test]
    fn test_trigger_direction_partition() {
        use ConditionKind::*;
        use TriggerDirection::*;
        assert_eq!(conditional(Side::Buy, TakeProfit, 1).trigger_direction(), Some(Lte));
        assert_eq!(conditional(Side::Sell, StopLoss, 1).trigger_direction(), Some(Lte));
        assert_eq!(conditional(Side::Sell, TakeProfit, 1).trigger_direction(), Some(Gte));
        assert_eq!(conditional(Side::Buy, StopLoss, 1).trigger_direction(), Some(Gte));
    }

    #[test]
    fn test_stop_loss_sell_can_trigger() {
        let order = conditional(Side::Sell, ConditionKind::StopLoss, 20);
        assert!(!order.can_trigger(Subticks(21)));
        assert!(order.can_trigger(Subticks(20)));
        assert!(order.can_trigger(Subticks(19)));
    }

    #[test]
    fn test_validate_rejects_mismatched_expiration() {
        let mut order = conditional(Side::Buy, ConditionKind::StopLoss, 10);
        assert!(order.validate().is_ok());
        order.good_til = GoodTil::Block(5);
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_validate_requires_conditional_params() {
        let mut order = conditional(Side::Buy, ConditionKind::StopLoss, 10);
        order.conditional = None;
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_must_be_stateful() {
        let mut order = conditional(Side::Buy, ConditionKind::StopLoss, 10);
        assert!(order.must_be_stateful().is_ok());
        order.order_id.flavor = OrderFlavor::ShortTerm;
        assert!(matches!(
            order.must_be_stateful(),
            Err(InvariantViolation::NotStateful(_))
        ));
    }

    #[test]
    fn test_good_til_serializes_as_seconds() {
        let good_til = GoodTil::Time(Utc.timestamp_opt(15, 0).unwrap());
        let json = serde_json::to_string(&good_til).unwrap();
        assert_eq!(json, r#"{"time":15}"#);
    }

    #[test]
    fn test_ioc_and_fok_never_rest() {
        assert!(TimeInForce::ImmediateOrCancel.never_rests());
        assert!(TimeInForce::FillOrKill.never_rests());
        assert!(!TimeInForce::GoodTilCancel.never_rests());
        assert!(!TimeInForce::PostOnly.never_rests());
    }
}
