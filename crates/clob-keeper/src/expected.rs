//! Collaborators the lifecycle engine consumes but does not own.
//!
//! The matching engine, collateral computation, and oracle aggregation all live
//! elsewhere; only their outputs flow in through these traits.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use clob_core::{BaseQuantums, ClobPairId, Order, OrderId, SubaccountId};

/// Which resting orders to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderFilter {
    ShortTerm,
    /// Long-term and triggered conditional orders. TWAP legs are left out;
    /// their parent is counted instead.
    Stateful,
}

/// Market granularity reported by the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderbookInfo {
    pub subticks_per_tick: u64,
    pub step_base_quantums: u64,
}

/// Cumulative fill of one order produced by a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedFill {
    pub order: Order,
    /// Total filled so far, not the delta of this match.
    pub total_filled: BaseQuantums,
}

/// Result of handing an order to the matching engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchOutcome {
    /// Fills for the taker and every maker it crossed.
    pub fills: Vec<MatchedFill>,
    /// Whether the taker's remainder now rests on the book.
    pub resting: bool,
}

pub trait MatchingEngine {
    fn place_order(&mut self, order: &Order) -> MatchOutcome;

    /// Put a stateful order back on the book after a restart, without matching.
    fn restore_order(&mut self, order: &Order, filled: BaseQuantums);

    /// Returns whether the order was resting.
    fn cancel_order(&mut self, order_id: &OrderId) -> bool;

    /// Drop resting short-term orders whose last valid block is below `height`.
    fn purge_expired_short_term(&mut self, height: u32) -> Vec<OrderId>;

    fn count_resting_orders(&self, subaccount: &SubaccountId, filter: OrderFilter) -> u32;

    fn orderbook(&self, market: ClobPairId) -> Option<OrderbookInfo>;
}

pub trait CollateralSource {
    /// Net collateral in quote quantums; negative when underwater.
    fn net_collateral(&self, subaccount: &SubaccountId) -> i128;
}

pub trait OracleSource {
    /// Oracle price in (fractional) subticks, `None` when the market has no price.
    fn price_subticks(&self, market: ClobPairId) -> Option<Decimal>;
}
