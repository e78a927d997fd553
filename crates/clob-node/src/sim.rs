//! In-process reference collaborators for block replay.
//!
//! `SimBook` is a minimal price-time book: enough to produce realistic fills
//! for the lifecycle engine, nothing more. No self-trade prevention, no
//! collateral checks on match.

use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

use clob_core::{
    BaseQuantums, ClobPairId, GoodTil, Order, OrderFlavor, OrderId, Side, SubaccountId,
    TimeInForce,
};
use clob_keeper::{
    CollateralSource, MatchOutcome, MatchedFill, MatchingEngine, OracleSource, OrderFilter,
    OrderbookInfo,
};

#[derive(Debug, Clone)]
struct Resting {
    order: Order,
    remaining: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SimBook {
    markets: BTreeMap<ClobPairId, OrderbookInfo>,
    /// Resting orders per market in arrival order.
    resting: BTreeMap<ClobPairId, Vec<Resting>>,
    /// Cumulative fill per order id.
    filled: HashMap<OrderId, u64>,
}

impl SimBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_market(&mut self, market: ClobPairId, info: OrderbookInfo) {
        self.markets.insert(market, info);
        self.resting.entry(market).or_default();
    }

    pub fn is_resting(&self, order_id: &OrderId) -> bool {
        self.resting
            .get(&order_id.clob_pair_id)
            .is_some_and(|book| book.iter().any(|r| &r.order.order_id == order_id))
    }

    pub fn resting_len(&self) -> usize {
        self.resting.values().map(Vec::len).sum()
    }

    fn crosses(taker: &Order, maker: &Order) -> bool {
        maker.side != taker.side
            && match taker.side {
                Side::Buy => maker.subticks <= taker.subticks,
                Side::Sell => maker.subticks >= taker.subticks,
            }
    }

    /// Index of the best crossing maker: best price, then earliest arrival.
    fn best_maker(book: &[Resting], taker: &Order) -> Option<usize> {
        book.iter()
            .enumerate()
            .filter(|(_, r)| Self::crosses(taker, &r.order))
            .min_by(|(ia, a), (ib, b)| {
                let by_price = match taker.side {
                    Side::Buy => a.order.subticks.cmp(&b.order.subticks),
                    Side::Sell => b.order.subticks.cmp(&a.order.subticks),
                };
                by_price.then(ia.cmp(ib))
            })
            .map(|(i, _)| i)
    }

    fn remove(&mut self, order_id: &OrderId) -> bool {
        let Some(book) = self.resting.get_mut(&order_id.clob_pair_id) else {
            return false;
        };
        let before = book.len();
        book.retain(|r| &r.order.order_id != order_id);
        book.len() != before
    }
}

impl MatchingEngine for SimBook {
    fn place_order(&mut self, order: &Order) -> MatchOutcome {
        let order_id = &order.order_id;
        self.remove(order_id);

        let already = self.filled.get(order_id).copied().unwrap_or(0);
        let mut remaining = order.quantums.inner().saturating_sub(already);
        let mut outcome = MatchOutcome::default();
        if remaining == 0 {
            return outcome;
        }

        let book = self.resting.entry(order.clob_pair_id()).or_default();
        let crossable: u64 = book
            .iter()
            .filter(|r| Self::crosses(order, &r.order))
            .map(|r| r.remaining)
            .sum();
        match order.time_in_force {
            TimeInForce::FillOrKill if crossable < remaining => {
                debug!(order_id = %order_id, crossable, remaining, "FOK order not fully fillable");
                return outcome;
            }
            TimeInForce::PostOnly if crossable > 0 => {
                debug!(order_id = %order_id, "Post-only order would cross");
                return outcome;
            }
            _ => {}
        }

        let mut taker_filled = 0u64;
        while remaining > 0 {
            let Some(index) = Self::best_maker(book, order) else {
                break;
            };
            let maker = &mut book[index];
            let size = remaining.min(maker.remaining);
            maker.remaining -= size;
            remaining -= size;
            taker_filled += size;

            let maker_total = self.filled.entry(maker.order.order_id.clone()).or_insert(0);
            *maker_total += size;
            trace!(
                taker = %order_id,
                maker = %maker.order.order_id,
                size,
                subticks = maker.order.subticks.inner(),
                "Matched"
            );
            outcome.fills.push(MatchedFill {
                order: maker.order.clone(),
                total_filled: BaseQuantums(*maker_total),
            });
            if maker.remaining == 0 {
                book.remove(index);
            }
        }

        if taker_filled > 0 {
            let total = self.filled.entry(order_id.clone()).or_insert(0);
            *total += taker_filled;
            outcome.fills.push(MatchedFill {
                order: order.clone(),
                total_filled: BaseQuantums(*total),
            });
        }

        if remaining > 0 && !order.time_in_force.never_rests() {
            book.push(Resting {
                order: order.clone(),
                remaining,
            });
            outcome.resting = true;
        }
        outcome
    }

    fn restore_order(&mut self, order: &Order, filled: BaseQuantums) {
        self.remove(&order.order_id);
        let remaining = order.quantums.inner().saturating_sub(filled.inner());
        if !filled.is_zero() {
            self.filled.insert(order.order_id.clone(), filled.inner());
        }
        if remaining > 0 {
            self.resting
                .entry(order.clob_pair_id())
                .or_default()
                .push(Resting {
                    order: order.clone(),
                    remaining,
                });
        }
    }

    fn cancel_order(&mut self, order_id: &OrderId) -> bool {
        self.remove(order_id)
    }

    fn purge_expired_short_term(&mut self, height: u32) -> Vec<OrderId> {
        let mut purged = Vec::new();
        for book in self.resting.values_mut() {
            book.retain(|r| match r.order.good_til {
                GoodTil::Block(last) if last < height => {
                    purged.push(r.order.order_id.clone());
                    false
                }
                _ => true,
            });
        }
        purged
    }

    fn count_resting_orders(&self, subaccount: &SubaccountId, filter: OrderFilter) -> u32 {
        let count = self
            .resting
            .values()
            .flatten()
            .filter(|r| r.order.subaccount_id() == subaccount)
            .filter(|r| match filter {
                OrderFilter::ShortTerm => r.order.flavor() == OrderFlavor::ShortTerm,
                OrderFilter::Stateful => matches!(
                    r.order.flavor(),
                    OrderFlavor::LongTerm | OrderFlavor::Conditional
                ),
            })
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn orderbook(&self, market: ClobPairId) -> Option<OrderbookInfo> {
        self.markets.get(&market).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimOracle {
    prices: BTreeMap<ClobPairId, Decimal>,
}

impl SimOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&mut self, market: ClobPairId, price: Decimal) {
        self.prices.insert(market, price);
    }
}

impl OracleSource for SimOracle {
    fn price_subticks(&self, market: ClobPairId) -> Option<Decimal> {
        self.prices.get(&market).copied()
    }
}

/// Fixed collateral per subaccount; unknown subaccounts have none.
#[derive(Debug, Clone, Default)]
pub struct SimCollateral {
    balances: HashMap<SubaccountId, i128>,
}

impl SimCollateral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, subaccount: SubaccountId, amount: i128) {
        self.balances.insert(subaccount, amount);
    }
}

impl CollateralSource for SimCollateral {
    fn net_collateral(&self, subaccount: &SubaccountId) -> i128 {
        self.balances.get(subaccount).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use clob_core::Subticks;

    fn order(owner: &str, client_id: u32, side: Side, size: u64, price: u64) -> Order {
        Order {
            order_id: OrderId::new(
                SubaccountId::new(owner, 0),
                client_id,
                ClobPairId(0),
                OrderFlavor::LongTerm,
            ),
            side,
            quantums: BaseQuantums(size),
            subticks: Subticks(price),
            time_in_force: TimeInForce::GoodTilCancel,
            good_til: GoodTil::Time(Utc.timestamp_opt(1_000, 0).unwrap()),
            reduce_only: false,
            conditional: None,
            twap: None,
        }
    }

    fn book() -> SimBook {
        let mut book = SimBook::new();
        book.add_market(
            ClobPairId(0),
            OrderbookInfo {
                subticks_per_tick: 1,
                step_base_quantums: 1,
            },
        );
        book
    }

    #[test]
    fn test_price_then_time_priority() {
        let mut book = book();
        book.place_order(&order("m1", 1, Side::Sell, 10, 52));
        book.place_order(&order("m2", 2, Side::Sell, 10, 51));
        book.place_order(&order("m3", 3, Side::Sell, 10, 51));

        let out = book.place_order(&order("t", 4, Side::Buy, 15, 52));
        let makers: Vec<_> = out.fills.iter().map(|f| f.order.order_id.client_id).collect();
        assert_eq!(makers, vec![2, 3, 4]);
        assert_eq!(out.fills[1].total_filled, BaseQuantums(5));
        assert_eq!(out.fills[2].total_filled, BaseQuantums(15));
        assert!(!out.resting);
        assert_eq!(book.resting_len(), 2);
    }

    #[test]
    fn test_fill_totals_are_cumulative() {
        let mut book = book();
        let maker = order("m", 1, Side::Sell, 10, 50);
        book.place_order(&maker);
        book.place_order(&order("t", 2, Side::Buy, 4, 50));
        let out = book.place_order(&order("t", 3, Side::Buy, 4, 50));
        assert_eq!(out.fills[0].total_filled, BaseQuantums(8));
    }

    #[test]
    fn test_fok_and_post_only() {
        let mut book = book();
        book.place_order(&order("m", 1, Side::Sell, 5, 50));

        let mut fok = order("t", 2, Side::Buy, 10, 50);
        fok.time_in_force = TimeInForce::FillOrKill;
        assert!(book.place_order(&fok).fills.is_empty());

        let mut post = order("t", 3, Side::Buy, 1, 50);
        post.time_in_force = TimeInForce::PostOnly;
        let out = book.place_order(&post);
        assert!(out.fills.is_empty() && !out.resting);
    }

    #[test]
    fn test_restore_respects_previous_fill() {
        let mut book = book();
        let maker = order("m", 1, Side::Sell, 10, 50);
        book.restore_order(&maker, BaseQuantums(7));
        let out = book.place_order(&order("t", 2, Side::Buy, 10, 50));
        assert_eq!(out.fills[0].total_filled, BaseQuantums(10));
        assert!(out.resting);
    }

    #[test]
    fn test_purge_expired_short_term() {
        let mut book = book();
        let mut short = order("a", 1, Side::Buy, 1, 10);
        short.order_id.flavor = OrderFlavor::ShortTerm;
        short.good_til = GoodTil::Block(5);
        book.place_order(&short);
        book.place_order(&order("a", 2, Side::Buy, 1, 10));
        let sub = SubaccountId::new("a", 0);
        assert_eq!(book.count_resting_orders(&sub, OrderFilter::ShortTerm), 1);

        assert!(book.purge_expired_short_term(5).is_empty());
        assert_eq!(book.purge_expired_short_term(6), vec![short.order_id]);
        assert_eq!(book.count_resting_orders(&sub, OrderFilter::ShortTerm), 0);
        assert_eq!(book.count_resting_orders(&sub, OrderFilter::Stateful), 1);
    }

    #[test]
    fn test_twap_legs_are_not_counted_as_stateful() {
        let mut book = book();
        let parent = OrderId::new(
            SubaccountId::new("a", 0),
            1,
            ClobPairId(0),
            OrderFlavor::TwapParent,
        );
        let mut leg = order("a", 1, Side::Buy, 1, 10);
        leg.order_id = parent.twap_leg(0);
        book.place_order(&leg);
        assert!(book.is_resting(&leg.order_id));
        let sub = SubaccountId::new("a", 0);
        assert_eq!(book.count_resting_orders(&sub, OrderFilter::Stateful), 0);
        assert_eq!(book.count_resting_orders(&sub, OrderFilter::ShortTerm), 0);
    }
}
