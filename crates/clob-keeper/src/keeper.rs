//! Lifecycle keeper: one durable store plus the components that index it.
//!
//! `ClobKeeper` is the only writer of the lifecycle keyspaces. Each call either
//! returns `Ok`, returns a `RejectReason` with no state touched, or returns an
//! `InvariantViolation` after which the caller must discard the keeper (the
//! node works on a per-block clone for exactly that purpose).

use rust_decimal::Decimal;
use std::time::Instant;
use tracing::{debug, info, warn};

use chrono::{DateTime, Utc};
use clob_core::{
    BaseQuantums, BlockInfo, ClobPairId, GoodTil, InvariantViolation, Order, OrderFlavor, OrderId,
    RejectReason, SubaccountId, TriggerDirection,
};
use clob_store::KvStore;
use clob_telemetry::Metrics;

use crate::conditional::ConditionalEngine;
use crate::context::BlockContext;
use crate::error::KeeperResult;
use crate::expected::{MatchedFill, OracleSource};
use crate::expiration::ExpirationIndex;
use crate::fills::{FillLedger, FillState};
use crate::stateful::{PlaceOutcome, StatefulOrderPlacement, StatefulOrderStore};
use crate::twap::{TwapEngine, TwapOrderPlacement};

/// Blocks a short-term fill record outlives the order's last valid block.
pub const DEFAULT_SHORT_BLOCK_WINDOW: u32 = 20;

/// Why an order was forgotten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Cancelled,
    Expired,
    Filled,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Filled => "filled",
        }
    }
}

/// Where a stateful placement ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementKind {
    /// Ready for the book.
    Book,
    /// Waiting on the oracle.
    Untriggered(TriggerDirection),
    /// Decomposed; legs are released at end of block.
    Twap { legs: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulPlacement {
    pub outcome: PlaceOutcome,
    pub kind: PlacementKind,
}

/// Result of applying a fill to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedFill {
    pub state: FillState,
    /// The order was fully filled and forgotten.
    pub removed: bool,
}

/// Everything the fixed end-of-block sequence produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndBlockOutcome {
    pub expired: Vec<OrderId>,
    /// Conditional orders moved to the placed keyspace, ready for the book.
    pub triggered: Vec<Order>,
    pub released_legs: Vec<Order>,
    pub pruned: Vec<OrderId>,
}

#[derive(Debug, Clone)]
pub struct ClobKeeper<S> {
    store: S,
    fills: FillLedger,
    orders: StatefulOrderStore,
    expirations: ExpirationIndex,
    triggers: ConditionalEngine,
    twap: TwapEngine,
    short_block_window: u32,
}

impl<S: KvStore> ClobKeeper<S> {
    /// Wrap a store. Call [`ClobKeeper::rehydrate`] before anything else.
    pub fn new(store: S, short_block_window: u32) -> Self {
        Self {
            store,
            fills: FillLedger::new(),
            orders: StatefulOrderStore::new(),
            expirations: ExpirationIndex::new(),
            triggers: ConditionalEngine::new(),
            twap: TwapEngine::new(),
            short_block_window,
        }
    }

    /// Rebuild every in-process mirror from the durable store.
    pub fn rehydrate(&mut self) -> KeeperResult<()> {
        let fills = self.fills.rehydrate(&self.store)?;
        self.orders.rehydrate(&self.store)?;
        let untriggered: Vec<Order> = self
            .orders
            .list_untriggered(&self.store)?
            .into_iter()
            .map(|p| p.order)
            .collect();
        let conditional = untriggered.len();
        self.triggers.rehydrate(&self.store, untriggered)?;
        info!(fills, conditional, "Lifecycle keeper rehydrated");
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn short_block_window(&self) -> u32 {
        self.short_block_window
    }

    // ------------------------------------------------------------------
    // Placement
    // ------------------------------------------------------------------

    /// Read-only conditional admission check, usable from the speculative phase.
    pub fn check_conditional(
        &self,
        order: &Order,
        oracle: &dyn OracleSource,
    ) -> Result<(), RejectReason> {
        let price = self.reference_price(order.clob_pair_id(), oracle)?;
        self.triggers.check_admission(order, price)
    }

    fn reference_price(
        &self,
        market: ClobPairId,
        oracle: &dyn OracleSource,
    ) -> Result<Decimal, RejectReason> {
        self.triggers
            .reference_price(market)
            .or_else(|| oracle.price_subticks(market))
            .ok_or_else(|| {
                RejectReason::InvalidOrder(format!("no oracle price for market {market}"))
            })
    }

    /// Stateless admission checks for a stateful placement at `block`.
    ///
    /// Shared by speculative screening and `place_stateful`, so both phases
    /// reject the same orders. Returns the order's expiration time.
    pub fn check_stateful(
        &self,
        order: &Order,
        block: &BlockInfo,
        subticks_per_tick: u64,
    ) -> KeeperResult<DateTime<Utc>> {
        order.must_be_stateful()?;
        order
            .validate()
            .map_err(|e| RejectReason::InvalidOrder(e.to_string()))?;
        let good_til = order.good_til_time().ok_or_else(|| {
            RejectReason::InvalidOrder("stateful orders expire by block time".to_string())
        })?;
        if good_til <= block.time {
            return Err(RejectReason::InvalidOrder(format!(
                "good_til {} is not after block time {}",
                good_til.timestamp(),
                block.time.timestamp()
            ))
            .into());
        }
        match order.flavor() {
            OrderFlavor::TwapLeg | OrderFlavor::ShortTerm => {
                return Err(RejectReason::InvalidOrder(format!(
                    "{} orders cannot be placed directly",
                    order.flavor()
                ))
                .into())
            }
            OrderFlavor::TwapParent => {
                self.twap.plan(order, subticks_per_tick)?;
            }
            OrderFlavor::LongTerm | OrderFlavor::Conditional => {}
        }
        Ok(good_til)
    }

    /// Record a stateful order.
    ///
    /// Every rejection is decided before the first write. Placing an id that
    /// already exists replaces the previous order, including its expiration.
    pub fn place_stateful(
        &mut self,
        order: &Order,
        ctx: &mut BlockContext,
        oracle: &dyn OracleSource,
        subticks_per_tick: u64,
    ) -> KeeperResult<StatefulPlacement> {
        let good_til = self.check_stateful(order, &ctx.block, subticks_per_tick)?;

        let placement = match order.flavor() {
            OrderFlavor::TwapLeg | OrderFlavor::ShortTerm => {
                return Err(InvariantViolation::Corrupt(format!(
                    "{} order {} passed stateful checks",
                    order.flavor(),
                    order.order_id
                ))
                .into())
            }
            OrderFlavor::LongTerm => {
                self.detach(&order.order_id)?;
                let (_, outcome) = self.orders.place(&mut self.store, order, ctx)?;
                StatefulPlacement {
                    outcome,
                    kind: PlacementKind::Book,
                }
            }
            OrderFlavor::Conditional => {
                let price = self.reference_price(order.clob_pair_id(), oracle)?;
                self.triggers.check_admission(order, price)?;
                self.detach(&order.order_id)?;
                let direction = self
                    .triggers
                    .add_untriggered(&mut self.store, order.clone(), price)?;
                let (_, outcome) = self.orders.place(&mut self.store, order, ctx)?;
                StatefulPlacement {
                    outcome,
                    kind: PlacementKind::Untriggered(direction),
                }
            }
            OrderFlavor::TwapParent => {
                let replaced = self.detach(&order.order_id)?;
                let legs = self
                    .twap
                    .place(&mut self.store, order, ctx, subticks_per_tick)?;
                let outcome = if replaced {
                    PlaceOutcome::Replaced
                } else {
                    PlaceOutcome::Created
                };
                Metrics::stateful_order_placed(order.flavor().as_str(), outcome.as_str());
                StatefulPlacement {
                    outcome,
                    kind: PlacementKind::Twap {
                        legs: legs.len() as u32,
                    },
                }
            }
        };

        self.expirations
            .add_to_slice(&mut self.store, good_til, &order.order_id)?;
        Ok(placement)
    }

    /// Undo the indexing of an existing order ahead of its replacement.
    ///
    /// The placement record itself stays so the store reports `Replaced`.
    fn detach(&mut self, order_id: &OrderId) -> KeeperResult<bool> {
        if order_id.flavor == OrderFlavor::TwapParent {
            let Some(existing) = self.twap.get_placement(&self.store, order_id)? else {
                return Ok(false);
            };
            self.remove_expiration(&existing.order)?;
            self.twap.cancel(&mut self.store, order_id)?;
            return Ok(true);
        }

        let Some(existing) = self.orders.get(&self.store, order_id)? else {
            return Ok(false);
        };
        self.remove_expiration(&existing.order)?;
        self.triggers.remove_orders(std::slice::from_ref(order_id));
        Ok(true)
    }

    fn remove_expiration(&mut self, order: &Order) -> KeeperResult<()> {
        if let Some(at) = order.good_til_time() {
            self.expirations
                .remove_from_slice(&mut self.store, at, &order.order_id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Forget an order: expiration, fill record and placement together.
    ///
    /// Returns the removed order, or `None` if nothing was known about it.
    pub fn remove_order(
        &mut self,
        order_id: &OrderId,
        reason: RemovalReason,
    ) -> KeeperResult<Option<Order>> {
        self.forget(order_id, reason, true)
    }

    fn forget(
        &mut self,
        order_id: &OrderId,
        reason: RemovalReason,
        indexed: bool,
    ) -> KeeperResult<Option<Order>> {
        let removed = match order_id.flavor {
            OrderFlavor::ShortTerm | OrderFlavor::TwapLeg => None,
            OrderFlavor::TwapParent => match self.twap.get_placement(&self.store, order_id)? {
                Some(placement) => {
                    if indexed {
                        self.remove_expiration(&placement.order)?;
                    }
                    self.twap.cancel(&mut self.store, order_id)?;
                    Some(placement.order)
                }
                None => None,
            },
            OrderFlavor::LongTerm | OrderFlavor::Conditional => {
                match self.orders.get(&self.store, order_id)? {
                    Some(placement) => {
                        if indexed {
                            self.remove_expiration(&placement.order)?;
                        }
                        self.triggers.remove_orders(std::slice::from_ref(order_id));
                        self.orders.delete(&mut self.store, order_id);
                        Some(placement.order)
                    }
                    None => None,
                }
            }
        };

        let had_fill = self.fills.remove_fill(&mut self.store, order_id)?;
        if removed.is_some() {
            Metrics::stateful_order_removed(order_id.flavor.as_str(), reason.as_str());
            debug!(
                order_id = %order_id,
                reason = reason.as_str(),
                had_fill,
                "Order forgotten"
            );
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------

    /// Record a fill reported by the matching engine.
    ///
    /// Short-term and TWAP leg records are scheduled for pruning a fixed window
    /// after they stop being valid. Stateful records stay until the order is
    /// forgotten; a fully filled stateful order is forgotten here.
    pub fn apply_fill(
        &mut self,
        fill: &MatchedFill,
        ctx: &BlockContext,
    ) -> KeeperResult<AppliedFill> {
        let order = &fill.order;
        let order_id = &order.order_id;
        let previous = self
            .fills
            .get_fill(order_id)?
            .map(|s| s.filled)
            .unwrap_or(BaseQuantums::ZERO);
        let delta = fill.total_filled.checked_sub(previous).ok_or_else(|| {
            InvariantViolation::Corrupt(format!(
                "fill for {order_id} went backwards from {previous} to {}",
                fill.total_filled
            ))
        })?;

        match order.flavor() {
            OrderFlavor::ShortTerm => {
                let GoodTil::Block(last_block) = order.good_til else {
                    return Err(InvariantViolation::Corrupt(format!(
                        "short-term order {order_id} without a block expiration"
                    ))
                    .into());
                };
                let state = self.record_prunable(
                    order_id,
                    fill.total_filled,
                    last_block.saturating_add(self.short_block_window),
                )?;
                Ok(AppliedFill {
                    state,
                    removed: false,
                })
            }
            OrderFlavor::TwapLeg => {
                let state = self.record_prunable(
                    order_id,
                    fill.total_filled,
                    ctx.block.height.saturating_add(self.short_block_window),
                )?;
                self.twap.on_leg_fill(&mut self.store, order_id, delta)?;
                Ok(AppliedFill {
                    state,
                    removed: false,
                })
            }
            OrderFlavor::LongTerm | OrderFlavor::Conditional | OrderFlavor::TwapParent => {
                let state = self.fills.record_fill(
                    &mut self.store,
                    order_id,
                    fill.total_filled,
                    u32::MAX,
                )?;
                let removed = fill.total_filled >= order.quantums
                    && self.forget(order_id, RemovalReason::Filled, true)?.is_some();
                Ok(AppliedFill { state, removed })
            }
        }
    }

    fn record_prunable(
        &mut self,
        order_id: &OrderId,
        filled: BaseQuantums,
        prunable_after: u32,
    ) -> KeeperResult<FillState> {
        let state = self
            .fills
            .record_fill(&mut self.store, order_id, filled, prunable_after)?;
        self.fills.schedule_pruning(
            &mut self.store,
            std::slice::from_ref(order_id),
            state.prunable_after,
        )?;
        Ok(state)
    }

    // ------------------------------------------------------------------
    // End of block
    // ------------------------------------------------------------------

    /// Run the fixed end-of-block sequence: expire, trigger, release TWAP legs,
    /// prune fills.
    pub fn end_block(
        &mut self,
        ctx: &mut BlockContext,
        oracle: &dyn OracleSource,
    ) -> KeeperResult<EndBlockOutcome> {
        let started = Instant::now();
        let mut outcome = EndBlockOutcome::default();

        outcome.expired = self
            .expirations
            .sweep_expired(&mut self.store, ctx.block.time)?;
        for order_id in &outcome.expired {
            if self.forget(order_id, RemovalReason::Expired, false)?.is_none() {
                warn!(order_id = %order_id, "Expired order had no placement record");
            }
        }

        for market in self.triggers.markets() {
            let Some(price) = oracle.price_subticks(market) else {
                warn!(market = %market, "No oracle price, skipping trigger poll");
                continue;
            };
            for order in self.triggers.poll(&mut self.store, market, price)? {
                self.orders.trigger(&mut self.store, &order.order_id, ctx)?;
                outcome.triggered.push(order);
            }
        }

        let release = self.twap.release_due(&mut self.store, ctx.block.time)?;
        for parent in &release.completed {
            self.remove_expiration(parent)?;
        }
        outcome.released_legs = release.legs;
        outcome.pruned = self.fills.sweep(&mut self.store, ctx.block.height)?;

        Metrics::end_block_duration(started.elapsed().as_secs_f64() * 1_000.0);
        info!(
            height = ctx.block.height,
            expired = outcome.expired.len(),
            triggered = outcome.triggered.len(),
            released = outcome.released_legs.len(),
            pruned = outcome.pruned.len(),
            "End block"
        );
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Placed stateful orders in `(block_height, sequence)` order, for warm start.
    pub fn list_all_orders(&self) -> KeeperResult<Vec<Order>> {
        Ok(self
            .orders
            .list_all(&self.store)?
            .into_iter()
            .map(|p| p.order)
            .collect())
    }

    pub fn get_order(&self, order_id: &OrderId) -> KeeperResult<Option<StatefulOrderPlacement>> {
        self.orders.get(&self.store, order_id)
    }

    /// Whether `order_id` is a live stateful order, TWAP parents included.
    pub fn is_live(&self, order_id: &OrderId) -> KeeperResult<bool> {
        if order_id.flavor == OrderFlavor::TwapParent {
            return Ok(self.twap.get_placement(&self.store, order_id)?.is_some());
        }
        Ok(self.orders.get(&self.store, order_id)?.is_some())
    }

    pub fn get_fill(&self, order_id: &OrderId) -> KeeperResult<Option<FillState>> {
        self.fills.get_fill(order_id)
    }

    pub fn all_fills(&self) -> KeeperResult<Vec<(OrderId, FillState)>> {
        self.fills.all_fills()
    }

    pub fn twap_placement(&self, parent_id: &OrderId) -> KeeperResult<Option<TwapOrderPlacement>> {
        self.twap.get_placement(&self.store, parent_id)
    }

    pub fn untriggered_count(&self, subaccount: &SubaccountId) -> usize {
        self.orders.untriggered_count(&self.store, subaccount)
    }

    pub fn stateful_count(&self, subaccount: &SubaccountId) -> u32 {
        self.orders.stateful_count(subaccount)
    }

    /// Live TWAP parents owned by one subaccount.
    pub fn twap_parent_count(&self, subaccount: &SubaccountId) -> usize {
        self.twap.parent_count(&self.store, subaccount)
    }

    pub fn expirations_at(&self, at: DateTime<Utc>) -> KeeperResult<Vec<OrderId>> {
        self.expirations.list_slice(&self.store, at)
    }
}
