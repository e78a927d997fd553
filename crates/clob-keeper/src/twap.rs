//! TWAP decomposition engine.
//!
//! A parent order is split into `duration / interval` immediate-or-cancel legs,
//! one per interval starting at the placement block time. Legs wait in a
//! trigger index keyed `(instant, leg id)` and are released in key order once
//! block time reaches them.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use clob_core::{
    BaseQuantums, GoodTil, InvariantViolation, Order, OrderFlavor, OrderId, RejectReason, Side,
    SubaccountId, Subticks, TimeInForce, PPM,
};
use clob_store::{codec, prefix_end, KvStore};
use clob_telemetry::Metrics;

use crate::context::BlockContext;
use crate::error::KeeperResult;
use crate::keys::{self, TWAP_TRIGGER_PREFIX};

/// Progress of a TWAP parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwapOrderPlacement {
    pub order: Order,
    pub remaining_legs: u32,
    pub remaining_quantums: BaseQuantums,
    pub block_height: u32,
}

/// Worst acceptable leg price: the parent limit moved by the tolerance against
/// the taker, then snapped to a tick (up for buys, down for sells, at least one
/// tick).
pub fn leg_bound_price(
    side: Side,
    limit: Subticks,
    tolerance_ppm: u32,
    subticks_per_tick: u64,
) -> Result<Subticks, RejectReason> {
    let tick = subticks_per_tick.max(1);
    let limit = limit.inner() as u128;
    let ppm = tolerance_ppm as u128;
    let scale = PPM as u128;
    match side {
        Side::Buy => {
            let raw = (limit * (scale + ppm)).div_ceil(scale);
            let raw = u64::try_from(raw).unwrap_or(u64::MAX);
            Ok(Subticks(raw).round_up_to_tick(tick))
        }
        Side::Sell => {
            let factor = scale.checked_sub(ppm).ok_or_else(|| {
                RejectReason::InvalidTwap(format!(
                    "price tolerance {tolerance_ppm} ppm exceeds 100% for a sell"
                ))
            })?;
            let raw = (limit * factor / scale) as u64;
            let bounded = Subticks(raw).round_down_to_tick(tick);
            Ok(bounded.max(Subticks(tick)))
        }
    }
}

/// How a parent will be split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TwapPlan {
    pub legs: u32,
    pub leg_size: u64,
    /// Added to the last leg.
    pub remainder: u64,
    pub interval_secs: u32,
    pub bound: Subticks,
}

/// Legs due this block and the parents they completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TwapRelease {
    pub legs: Vec<Order>,
    pub completed: Vec<Order>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TwapEngine;

impl TwapEngine {
    pub fn new() -> Self {
        Self
    }

    /// Check a parent can be decomposed without touching state.
    pub fn plan(&self, parent: &Order, subticks_per_tick: u64) -> Result<TwapPlan, RejectReason> {
        let params = parent.twap.ok_or_else(|| {
            RejectReason::InvalidTwap("parent carries no twap parameters".to_string())
        })?;
        if parent.flavor() != OrderFlavor::TwapParent {
            return Err(RejectReason::InvalidTwap(format!(
                "{} orders cannot be decomposed",
                parent.flavor()
            )));
        }
        if params.interval_secs == 0 {
            return Err(RejectReason::InvalidTwap("interval must be positive".to_string()));
        }
        let legs = params.duration_secs / params.interval_secs;
        if legs == 0 {
            return Err(RejectReason::InvalidTwap(format!(
                "duration {}s shorter than interval {}s",
                params.duration_secs, params.interval_secs
            )));
        }
        let leg_size = parent.quantums.inner() / legs as u64;
        if leg_size == 0 {
            return Err(RejectReason::InvalidTwap(format!(
                "{} quantums cannot be split into {legs} legs",
                parent.quantums
            )));
        }
        Ok(TwapPlan {
            legs,
            leg_size,
            remainder: parent.quantums.inner() % legs as u64,
            interval_secs: params.interval_secs,
            bound: leg_bound_price(
                parent.side,
                parent.subticks,
                params.price_tolerance_ppm,
                subticks_per_tick,
            )?,
        })
    }

    /// Split `parent` into legs, persist the parent and index every leg.
    pub fn place<S: KvStore>(
        &self,
        store: &mut S,
        parent: &Order,
        ctx: &BlockContext,
        subticks_per_tick: u64,
    ) -> KeeperResult<Vec<Order>> {
        parent.must_be_stateful()?;
        let TwapPlan {
            legs,
            leg_size,
            remainder,
            interval_secs,
            bound,
        } = self.plan(parent, subticks_per_tick)?;

        let mut orders = Vec::with_capacity(legs as usize);
        for i in 0..legs {
            let at = ctx.block.time + Duration::seconds(i as i64 * interval_secs as i64);
            let quantums = if i + 1 == legs {
                leg_size + remainder
            } else {
                leg_size
            };
            let leg = Order {
                order_id: parent.order_id.twap_leg(i),
                side: parent.side,
                quantums: BaseQuantums(quantums),
                subticks: bound,
                time_in_force: TimeInForce::ImmediateOrCancel,
                good_til: GoodTil::Time(at),
                reduce_only: parent.reduce_only,
                conditional: None,
                twap: None,
            };
            store.set(
                keys::twap_trigger_key(&at, &leg.order_id),
                codec::encode(&leg)?,
            );
            orders.push(leg);
        }

        let placement = TwapOrderPlacement {
            order: parent.clone(),
            remaining_legs: legs,
            remaining_quantums: parent.quantums,
            block_height: ctx.block.height,
        };
        store.set(
            keys::twap_parent_key(&parent.order_id),
            codec::encode(&placement)?,
        );
        info!(
            order_id = %parent.order_id,
            legs,
            leg_size,
            bound = %bound,
            "TWAP order decomposed"
        );
        Ok(orders)
    }

    /// Drain every leg whose trigger instant is at or before `now`, in key order.
    pub fn release_due<S: KvStore>(
        &self,
        store: &mut S,
        now: DateTime<Utc>,
    ) -> KeeperResult<TwapRelease> {
        let end = now
            .timestamp()
            .checked_add(1)
            .and_then(|next| Utc.timestamp_opt(next, 0).single())
            .map(|next| codec::join(TWAP_TRIGGER_PREFIX, &[&codec::time_key(&next)]))
            .or_else(|| prefix_end(TWAP_TRIGGER_PREFIX));

        let mut release = TwapRelease::default();
        for (key, value) in store.range(TWAP_TRIGGER_PREFIX, end.as_deref()) {
            let leg: Order = codec::decode(&value)?;
            store.delete(&key);

            let parent_id = leg.order_id.twap_parent().ok_or_else(|| {
                InvariantViolation::Corrupt(format!(
                    "twap trigger entry {} is not a leg",
                    leg.order_id
                ))
            })?;
            let parent_key = keys::twap_parent_key(&parent_id);
            let mut placement: TwapOrderPlacement = store
                .get(&parent_key)
                .map(|bytes| codec::decode(&bytes))
                .transpose()?
                .ok_or_else(|| InvariantViolation::MissingOrder(parent_id.clone()))?;

            placement.remaining_legs = placement.remaining_legs.saturating_sub(1);
            if placement.remaining_legs == 0 {
                store.delete(&parent_key);
                debug!(order_id = %parent_id, "TWAP parent completed");
                release.completed.push(placement.order);
            } else {
                store.set(parent_key, codec::encode(&placement)?);
            }
            release.legs.push(leg);
        }

        if !release.legs.is_empty() {
            Metrics::twap_legs_released(release.legs.len());
        }
        Ok(release)
    }

    /// Account a leg fill against its parent's remaining quantity.
    ///
    /// Returns `None` when the parent has already completed or been cancelled.
    pub fn on_leg_fill<S: KvStore>(
        &self,
        store: &mut S,
        leg_id: &OrderId,
        filled: BaseQuantums,
    ) -> KeeperResult<Option<TwapOrderPlacement>> {
        let Some(parent_id) = leg_id.twap_parent() else {
            return Err(InvariantViolation::Corrupt(format!("{leg_id} is not a twap leg")).into());
        };
        let Some(mut placement) = self.get_placement(store, &parent_id)? else {
            return Ok(None);
        };
        placement.remaining_quantums = placement
            .remaining_quantums
            .checked_sub(filled)
            .ok_or_else(|| InvariantViolation::TwapQuantityUnderflow {
                order_id: parent_id.clone(),
                remaining: placement.remaining_quantums,
                filled,
            })?;
        store.set(
            keys::twap_parent_key(&parent_id),
            codec::encode(&placement)?,
        );
        Ok(Some(placement))
    }

    /// Drop a parent and every pending leg. Returns the number of legs dropped,
    /// or `None` if the parent is unknown.
    pub fn cancel<S: KvStore>(
        &self,
        store: &mut S,
        parent_id: &OrderId,
    ) -> KeeperResult<Option<u32>> {
        if !store.delete(&keys::twap_parent_key(parent_id)) {
            return Ok(None);
        }
        let mut dropped = 0;
        for (key, value) in store.prefix(TWAP_TRIGGER_PREFIX) {
            let leg: Order = codec::decode(&value)?;
            if leg.order_id.twap_parent().as_ref() == Some(parent_id) {
                store.delete(&key);
                dropped += 1;
            }
        }
        debug!(order_id = %parent_id, dropped, "TWAP parent cancelled");
        Ok(Some(dropped))
    }

    /// Live parents owned by one subaccount.
    pub fn parent_count<S: KvStore>(&self, store: &S, subaccount: &SubaccountId) -> usize {
        store
            .prefix(&keys::twap_parent_subaccount_prefix(subaccount))
            .len()
    }

    pub fn get_placement<S: KvStore>(
        &self,
        store: &S,
        parent_id: &OrderId,
    ) -> KeeperResult<Option<TwapOrderPlacement>> {
        match store.get(&keys::twap_parent_key(parent_id)) {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeeperError;
    use clob_core::{BlockInfo, ClobPairId, ExecMode, SubaccountId, TwapParams};
    use clob_store::MemStore;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn ctx(secs: i64) -> BlockContext {
        BlockContext::new(BlockInfo::new(7, t(secs)), ExecMode::Committed)
    }

    fn parent(client_id: u32, quantums: u64, duration: u32, interval: u32) -> Order {
        Order {
            order_id: OrderId::new(
                SubaccountId::new("alice", 0),
                client_id,
                ClobPairId(0),
                OrderFlavor::TwapParent,
            ),
            side: Side::Buy,
            quantums: BaseQuantums(quantums),
            subticks: Subticks(1_000),
            time_in_force: TimeInForce::GoodTilCancel,
            good_til: GoodTil::Time(t(10_000)),
            reduce_only: false,
            conditional: None,
            twap: Some(TwapParams {
                duration_secs: duration,
                interval_secs: interval,
                price_tolerance_ppm: 10_000,
            }),
        }
    }

    #[test]
    fn test_five_equal_legs() {
        let mut store = MemStore::new();
        let engine = TwapEngine::new();
        let legs = engine
            .place(&mut store, &parent(1, 100, 300, 60), &ctx(1_000), 1)
            .unwrap();

        assert_eq!(legs.len(), 5);
        for (i, leg) in legs.iter().enumerate() {
            assert_eq!(leg.quantums, BaseQuantums(20));
            assert_eq!(leg.time_in_force, TimeInForce::ImmediateOrCancel);
            assert_eq!(leg.good_til, GoodTil::Time(t(1_000 + 60 * i as i64)));
            assert_eq!(leg.order_id.sequence, i as u32);
        }
        let placement = engine
            .get_placement(&store, &parent(1, 100, 300, 60).order_id)
            .unwrap()
            .unwrap();
        assert_eq!(placement.remaining_legs, 5);
    }

    #[test]
    fn test_last_leg_absorbs_remainder() {
        let mut store = MemStore::new();
        let legs = TwapEngine::new()
            .place(&mut store, &parent(1, 103, 300, 60), &ctx(0), 1)
            .unwrap();
        let sizes: Vec<u64> = legs.iter().map(|l| l.quantums.inner()).collect();
        assert_eq!(sizes, vec![20, 20, 20, 20, 23]);
    }

    #[test]
    fn test_zero_legs_rejected() {
        let mut store = MemStore::new();
        let err = TwapEngine::new()
            .place(&mut store, &parent(1, 100, 30, 60), &ctx(0), 1)
            .unwrap_err();
        assert!(matches!(err, KeeperError::Rejected(RejectReason::InvalidTwap(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_bound_price_rounding() {
        // 1000 * 1.01 = 1010 -> up to tick 25 = 1025
        assert_eq!(
            leg_bound_price(Side::Buy, Subticks(1_000), 10_000, 25).unwrap(),
            Subticks(1_025)
        );
        // 1000 * 0.99 = 990 -> down to tick 25 = 975
        assert_eq!(
            leg_bound_price(Side::Sell, Subticks(1_000), 10_000, 25).unwrap(),
            Subticks(975)
        );
        // never below one tick
        assert_eq!(
            leg_bound_price(Side::Sell, Subticks(10), 990_000, 25).unwrap(),
            Subticks(25)
        );
        assert!(leg_bound_price(Side::Sell, Subticks(10), 2_000_000, 1).is_err());
    }

    #[test]
    fn test_release_in_time_then_id_order() {
        let mut store = MemStore::new();
        let engine = TwapEngine::new();
        engine
            .place(&mut store, &parent(2, 100, 120, 60), &ctx(0), 1)
            .unwrap();
        engine
            .place(&mut store, &parent(1, 100, 120, 60), &ctx(0), 1)
            .unwrap();

        let first: Vec<(u32, u32)> = engine
            .release_due(&mut store, t(0))
            .unwrap()
            .legs
            .iter()
            .map(|l| (l.order_id.client_id, l.order_id.sequence))
            .collect();
        assert_eq!(first, vec![(1, 0), (2, 0)]);

        let second = engine.release_due(&mut store, t(90)).unwrap();
        assert_eq!(second.legs.len(), 2);
        assert_eq!(second.completed.len(), 2);
        assert!(engine
            .get_placement(&store, &parent(1, 100, 120, 60).order_id)
            .unwrap()
            .is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_leg_fill_underflow_is_fatal() {
        let mut store = MemStore::new();
        let engine = TwapEngine::new();
        let legs = engine
            .place(&mut store, &parent(1, 100, 300, 60), &ctx(0), 1)
            .unwrap();
        let placement = engine
            .on_leg_fill(&mut store, &legs[0].order_id, BaseQuantums(20))
            .unwrap()
            .unwrap();
        assert_eq!(placement.remaining_quantums, BaseQuantums(80));

        let err = engine
            .on_leg_fill(&mut store, &legs[1].order_id, BaseQuantums(81))
            .unwrap_err();
        assert!(matches!(
            err,
            KeeperError::Invariant(InvariantViolation::TwapQuantityUnderflow { .. })
        ));
    }

    #[test]
    fn test_cancel_drops_pending_legs() {
        let mut store = MemStore::new();
        let engine = TwapEngine::new();
        let p1 = parent(1, 100, 300, 60);
        let p2 = parent(2, 100, 300, 60);
        engine.place(&mut store, &p1, &ctx(0), 1).unwrap();
        engine.place(&mut store, &p2, &ctx(0), 1).unwrap();

        assert_eq!(engine.cancel(&mut store, &p1.order_id).unwrap(), Some(5));
        assert_eq!(engine.cancel(&mut store, &p1.order_id).unwrap(), None);
        let release = engine.release_due(&mut store, t(1_000)).unwrap();
        assert_eq!(release.legs.len(), 5);
        assert_eq!(release.completed, vec![p2]);
    }
}
