//! Conditional trigger engine.
//!
//! Per market, untriggered conditional orders are split by the direction that
//! fires them. Each block the engine is polled once per market with the fresh
//! oracle price; matches are removed in their original relative order.
//!
//! # Rounding
//!
//! Oracle prices arrive as fractional subticks and are rounded against the
//! order: `ceil` for LTE comparisons, `floor` for GTE comparisons.
//!
//! # Exclusivity
//!
//! Admission is checked against the market's last polled price (seeded from
//! the oracle the first time a market sees an order). Every resting LTE
//! trigger is then strictly below every resting GTE trigger, so no single
//! price can fire both sides. If that ever happens anyway the block aborts.

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info};

use clob_core::{
    ClobPairId, InvariantViolation, Order, OrderId, RejectReason, Subticks, TriggerDirection,
};
use clob_store::{codec, KvStore};
use clob_telemetry::Metrics;

use crate::error::KeeperResult;
use crate::keys::{self, TRIGGER_PRICE_PREFIX};

/// Untriggered orders of one market.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UntriggeredOrders {
    /// Fire when oracle <= trigger (take-profit buys, stop-loss sells).
    pub lte: Vec<Order>,
    /// Fire when oracle >= trigger (take-profit sells, stop-loss buys).
    pub gte: Vec<Order>,
}

impl UntriggeredOrders {
    pub fn len(&self) -> usize {
        self.lte.len() + self.gte.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lte.is_empty() && self.gte.is_empty()
    }
}

/// Round an oracle price pessimistically for a trigger direction.
pub fn rounded_oracle(direction: TriggerDirection, price: Decimal) -> Subticks {
    match direction {
        TriggerDirection::Lte => Subticks::ceil_from(price),
        TriggerDirection::Gte => Subticks::floor_from(price),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConditionalEngine {
    markets: BTreeMap<ClobPairId, UntriggeredOrders>,
    last_price: BTreeMap<ClobPairId, Decimal>,
}

impl ConditionalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from untriggered placements (already in placement order) and
    /// the persisted per-market reference prices.
    pub fn rehydrate<S: KvStore>(&mut self, store: &S, orders: Vec<Order>) -> KeeperResult<()> {
        self.markets.clear();
        self.last_price.clear();

        for (key, value) in store.prefix(TRIGGER_PRICE_PREFIX) {
            let raw: [u8; 4] = keys::suffix(&key, TRIGGER_PRICE_PREFIX)
                .try_into()
                .map_err(|_| InvariantViolation::Corrupt("trigger price key".to_string()))?;
            let price: Decimal = codec::decode(&value)?;
            self.last_price.insert(ClobPairId(u32::from_be_bytes(raw)), price);
        }

        let count = orders.len();
        for order in orders {
            self.classify(order)?;
        }
        for (market, orders) in &self.markets {
            Metrics::untriggered_orders(&market.to_string(), orders.len());
        }
        info!(
            untriggered = count,
            markets = self.markets.len(),
            "Conditional trigger engine rehydrated"
        );
        Ok(())
    }

    /// Reference price admission is checked against.
    pub fn reference_price(&self, market: ClobPairId) -> Option<Decimal> {
        self.last_price.get(&market).copied()
    }

    /// Reject an order that would fire at the market's reference price.
    ///
    /// `oracle` is only consulted when the market has never been polled.
    pub fn check_admission(&self, order: &Order, oracle: Decimal) -> Result<(), RejectReason> {
        let Some(direction) = order.trigger_direction() else {
            return Err(RejectReason::InvalidOrder(
                "conditional order without trigger parameters".to_string(),
            ));
        };
        let price = self.reference_price(order.clob_pair_id()).unwrap_or(oracle);
        let rounded = rounded_oracle(direction, price);
        if order.can_trigger(rounded) {
            let trigger = order
                .conditional
                .map(|c| c.trigger_subticks)
                .unwrap_or(Subticks::ZERO);
            return Err(RejectReason::WouldTriggerImmediately {
                trigger,
                oracle: rounded,
            });
        }
        Ok(())
    }

    /// Admit an untriggered conditional order.
    pub fn add_untriggered<S: KvStore>(
        &mut self,
        store: &mut S,
        order: Order,
        oracle: Decimal,
    ) -> KeeperResult<TriggerDirection> {
        order.must_be_conditional()?;
        self.check_admission(&order, oracle)?;

        let market = order.clob_pair_id();
        if !self.last_price.contains_key(&market) {
            self.set_reference_price(store, market, oracle)?;
        }
        let direction = self.classify(order)?;
        if let Some(orders) = self.markets.get(&market) {
            Metrics::untriggered_orders(&market.to_string(), orders.len());
        }
        Ok(direction)
    }

    fn classify(&mut self, order: Order) -> KeeperResult<TriggerDirection> {
        let direction = order
            .trigger_direction()
            .ok_or_else(|| InvariantViolation::NotConditional(order.order_id.clone()))?;
        let entry = self.markets.entry(order.clob_pair_id()).or_default();
        match direction {
            TriggerDirection::Lte => entry.lte.push(order),
            TriggerDirection::Gte => entry.gte.push(order),
        }
        Ok(direction)
    }

    fn set_reference_price<S: KvStore>(
        &mut self,
        store: &mut S,
        market: ClobPairId,
        price: Decimal,
    ) -> KeeperResult<()> {
        store.set(keys::trigger_price_key(market), codec::encode(&price)?);
        self.last_price.insert(market, price);
        Ok(())
    }

    /// Drop the given ids from every market. Returns how many were removed.
    pub fn remove_orders(&mut self, order_ids: &[OrderId]) -> usize {
        if order_ids.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for (market, orders) in self.markets.iter_mut() {
            let before = orders.len();
            orders.lte.retain(|o| !order_ids.contains(&o.order_id));
            orders.gte.retain(|o| !order_ids.contains(&o.order_id));
            if orders.len() != before {
                removed += before - orders.len();
                Metrics::untriggered_orders(&market.to_string(), orders.len());
            }
        }
        self.markets.retain(|_, orders| !orders.is_empty());
        removed
    }

    /// Markets holding untriggered orders, ascending.
    pub fn markets(&self) -> Vec<ClobPairId> {
        self.markets.keys().copied().collect()
    }

    pub fn untriggered(&self, market: ClobPairId) -> Option<&UntriggeredOrders> {
        self.markets.get(&market)
    }

    /// Fire every order of `market` that triggers at `price`.
    ///
    /// Triggered orders keep their relative order: LTE matches first, then GTE
    /// (only one side may match). The polled price becomes the market's new
    /// reference price.
    pub fn poll<S: KvStore>(
        &mut self,
        store: &mut S,
        market: ClobPairId,
        price: Decimal,
    ) -> KeeperResult<Vec<Order>> {
        self.set_reference_price(store, market, price)?;
        let Some(orders) = self.markets.get_mut(&market) else {
            return Ok(Vec::new());
        };

        let lte_price = rounded_oracle(TriggerDirection::Lte, price);
        let gte_price = rounded_oracle(TriggerDirection::Gte, price);
        let (lte_hit, lte_rest): (Vec<Order>, Vec<Order>) = std::mem::take(&mut orders.lte)
            .into_iter()
            .partition(|o| o.can_trigger(lte_price));
        let (gte_hit, gte_rest): (Vec<Order>, Vec<Order>) = std::mem::take(&mut orders.gte)
            .into_iter()
            .partition(|o| o.can_trigger(gte_price));

        if !lte_hit.is_empty() && !gte_hit.is_empty() {
            return Err(InvariantViolation::BothDirectionsTriggered {
                market,
                lte: lte_hit.len(),
                gte: gte_hit.len(),
            }
            .into());
        }

        orders.lte = lte_rest;
        orders.gte = gte_rest;
        let remaining = orders.len();
        if orders.is_empty() {
            self.markets.remove(&market);
        }

        let label = market.to_string();
        Metrics::untriggered_orders(&label, remaining);
        if !lte_hit.is_empty() {
            Metrics::conditional_triggered(&label, TriggerDirection::Lte.as_str(), lte_hit.len());
        }
        if !gte_hit.is_empty() {
            Metrics::conditional_triggered(&label, TriggerDirection::Gte.as_str(), gte_hit.len());
        }

        let mut triggered = lte_hit;
        triggered.extend(gte_hit);
        if !triggered.is_empty() {
            debug!(
                market = %market,
                price = %price,
                triggered = triggered.len(),
                remaining,
                "Conditional orders triggered"
            );
        }
        Ok(triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeeperError;
    use chrono::{TimeZone, Utc};
    use clob_core::{
        BaseQuantums, ConditionKind, ConditionalParams, GoodTil, OrderFlavor, Side, SubaccountId,
        TimeInForce,
    };
    use clob_store::MemStore;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn conditional(client_id: u32, side: Side, kind: ConditionKind, trigger: u64) -> Order {
        Order {
            order_id: OrderId::new(
                SubaccountId::new("alice", 0),
                client_id,
                ClobPairId(1),
                OrderFlavor::Conditional,
            ),
            side,
            quantums: BaseQuantums(10),
            subticks: Subticks(trigger),
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
    fn test_stop_loss_sell_triggers_at_or_below() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        let order = conditional(1, Side::Sell, ConditionKind::StopLoss, 20);
        engine
            .add_untriggered(&mut store, order.clone(), dec!(25))
            .unwrap();

        assert!(engine
            .poll(&mut store, ClobPairId(1), dec!(21))
            .unwrap()
            .is_empty());
        // 20.4 rounds up to 21 for an LTE comparison
        assert!(engine
            .poll(&mut store, ClobPairId(1), dec!(20.4))
            .unwrap()
            .is_empty());
        let fired = engine.poll(&mut store, ClobPairId(1), dec!(20)).unwrap();
        assert_eq!(fired, vec![order]);
        assert!(engine.markets().is_empty());
    }

    #[test]
    fn test_gte_uses_floor() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        let order = conditional(1, Side::Buy, ConditionKind::StopLoss, 30);
        engine.add_untriggered(&mut store, order, dec!(25)).unwrap();
        assert!(engine
            .poll(&mut store, ClobPairId(1), dec!(29.9))
            .unwrap()
            .is_empty());
        assert_eq!(
            engine
                .poll(&mut store, ClobPairId(1), dec!(30.2))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_poll_preserves_relative_order() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        for (id, trigger) in [(1, 10), (2, 18), (3, 12), (4, 15)] {
            engine
                .add_untriggered(
                    &mut store,
                    conditional(id, Side::Sell, ConditionKind::StopLoss, trigger),
                    dec!(20),
                )
                .unwrap();
        }
        let fired: Vec<u32> = engine
            .poll(&mut store, ClobPairId(1), dec!(14))
            .unwrap()
            .into_iter()
            .map(|o| o.order_id.client_id)
            .collect();
        assert_eq!(fired, vec![2, 4]);
        let rest: Vec<u32> = engine
            .untriggered(ClobPairId(1))
            .unwrap()
            .lte
            .iter()
            .map(|o| o.order_id.client_id)
            .collect();
        assert_eq!(rest, vec![1, 3]);
    }

    #[test]
    fn test_admission_rejects_immediate_trigger() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        engine.poll(&mut store, ClobPairId(1), dec!(20)).unwrap();

        let err = engine
            .add_untriggered(
                &mut store,
                conditional(1, Side::Sell, ConditionKind::StopLoss, 22),
                dec!(50),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            KeeperError::Rejected(RejectReason::WouldTriggerImmediately { .. })
        ));
        assert!(!err.is_fatal());
        assert!(engine.markets().is_empty());
    }

    #[test]
    fn test_both_directions_is_fatal() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        // Bypass admission to construct a crossed book.
        engine
            .classify(conditional(1, Side::Sell, ConditionKind::StopLoss, 30))
            .unwrap();
        engine
            .classify(conditional(2, Side::Buy, ConditionKind::StopLoss, 10))
            .unwrap();
        let err = engine.poll(&mut store, ClobPairId(1), dec!(20)).unwrap_err();
        assert!(matches!(
            err,
            KeeperError::Invariant(InvariantViolation::BothDirectionsTriggered { .. })
        ));
    }

    #[test]
    fn test_remove_orders_drops_empty_markets() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        let order = conditional(1, Side::Sell, ConditionKind::StopLoss, 10);
        engine
            .add_untriggered(&mut store, order.clone(), dec!(20))
            .unwrap();
        assert_eq!(engine.remove_orders(&[order.order_id]), 1);
        assert!(engine.markets().is_empty());
    }

    #[test]
    fn test_rehydrate_restores_reference_price() {
        let mut store = MemStore::new();
        let mut engine = ConditionalEngine::new();
        engine.poll(&mut store, ClobPairId(1), dec!(20.5)).unwrap();
        let order = conditional(1, Side::Sell, ConditionKind::StopLoss, 10);
        engine
            .add_untriggered(&mut store, order.clone(), dec!(99))
            .unwrap();

        let mut restarted = ConditionalEngine::new();
        restarted.rehydrate(&store, vec![order]).unwrap();
        assert_eq!(restarted.reference_price(ClobPairId(1)), Some(dec!(20.5)));
        assert_eq!(restarted.untriggered(ClobPairId(1)).unwrap().lte.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_admitted_orders_never_fire_both_sides(
            reference in 1u64..1_000,
            triggers in prop::collection::vec((any::<bool>(), any::<bool>(), 1u64..1_000), 1..30),
            fractional in 0u32..100,
            polls in prop::collection::vec(1u64..1_000, 1..10),
        ) {
            let mut store = MemStore::new();
            let mut engine = ConditionalEngine::new();
            let start = Decimal::from(reference) + Decimal::new(fractional as i64, 2);
            for (i, (buy, take_profit, trigger)) in triggers.into_iter().enumerate() {
                let side = if buy { Side::Buy } else { Side::Sell };
                let kind = if take_profit {
                    ConditionKind::TakeProfit
                } else {
                    ConditionKind::StopLoss
                };
                let _ = engine.add_untriggered(
                    &mut store,
                    conditional(i as u32, side, kind, trigger),
                    start,
                );
            }
            for price in polls {
                prop_assert!(engine.poll(&mut store, ClobPairId(1), Decimal::from(price)).is_ok());
            }
        }
    }
}
