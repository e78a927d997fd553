//! Block pipeline.
//!
//! A block goes through two passes:
//! - speculative: each request is screened against committed state, the way a
//!   mempool would. Nothing durable changes; only the speculative counters and
//!   rate limiters move.
//! - committed: surviving requests run in order against a clone of the keeper.
//!   The clone replaces the live keeper only once the whole block, end-of-block
//!   included, has succeeded.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use clob_core::{BaseQuantums, BlockInfo, ExecMode, GoodTil, Order, OrderId, RejectReason};
use clob_keeper::{
    pending_stateful_count, BlockContext, ClobKeeper, CollateralSource, MatchOutcome,
    MatchingEngine, OracleSource, OrderFilter, OrderbookInfo, PlaceOutcome, PlacementKind,
    RemovalReason, UncommittedOrderCounts,
};
use clob_risk::ClobRateLimiters;
use clob_store::{load_snapshot, save_snapshot, MemStore};
use clob_telemetry::Metrics;

use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};

/// One request inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tx {
    Place(Order),
    Cancel(OrderId),
}

impl Tx {
    pub fn order_id(&self) -> &OrderId {
        match self {
            Self::Place(order) => &order.order_id,
            Self::Cancel(order_id) => order_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub order_id: OrderId,
    pub phase: ExecMode,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FillReport {
    pub order_id: OrderId,
    pub total_filled: BaseQuantums,
    /// The order was fully filled and forgotten.
    pub removed: bool,
}

/// What a committed block did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BlockReport {
    pub height: u32,
    pub placed: Vec<OrderId>,
    pub cancelled: Vec<OrderId>,
    pub rejected: Vec<Rejection>,
    pub fills: Vec<FillReport>,
    pub expired: Vec<OrderId>,
    pub triggered: Vec<OrderId>,
    pub released_legs: Vec<OrderId>,
    pub pruned: Vec<OrderId>,
}

/// The node: committed lifecycle state plus the matching engine it feeds.
pub struct Node<M> {
    config: NodeConfig,
    keeper: ClobKeeper<MemStore>,
    matching: M,
    rate_limiters: ClobRateLimiters,
    uncommitted: UncommittedOrderCounts,
    last_height: u32,
}

impl<M: MatchingEngine> Node<M> {
    /// Start from the configured snapshot, or from empty state.
    ///
    /// Placed stateful orders are put back on `matching` with their fills.
    pub fn new(config: NodeConfig, matching: M) -> NodeResult<Self> {
        config.validate()?;

        let snapshot = match &config.snapshot_path {
            Some(path) => load_snapshot(path)?,
            None => None,
        };
        let (store, last_height) = match snapshot {
            Some(snapshot) => (snapshot.store, snapshot.height),
            None => (MemStore::new(), 0),
        };

        let mut keeper = ClobKeeper::new(store, config.short_block_window);
        keeper.rehydrate()?;
        let rate_limiters = ClobRateLimiters::new(&config.rate_limits);

        let mut node = Self {
            config,
            keeper,
            matching,
            rate_limiters,
            uncommitted: UncommittedOrderCounts::new(),
            last_height,
        };
        node.warm_start()?;
        Ok(node)
    }

    fn warm_start(&mut self) -> NodeResult<()> {
        let orders = self.keeper.list_all_orders()?;
        for order in &orders {
            let filled = self
                .keeper
                .get_fill(&order.order_id)?
                .map(|f| f.filled)
                .unwrap_or(BaseQuantums::ZERO);
            self.matching.restore_order(order, filled);
        }
        info!(
            orders = orders.len(),
            height = self.last_height,
            "Restored resting stateful orders"
        );
        Ok(())
    }

    pub fn keeper(&self) -> &ClobKeeper<MemStore> {
        &self.keeper
    }

    pub fn matching(&self) -> &M {
        &self.matching
    }

    pub fn uncommitted(&self) -> &UncommittedOrderCounts {
        &self.uncommitted
    }

    pub fn last_height(&self) -> u32 {
        self.last_height
    }

    /// Screen `txs` speculatively, then commit the survivors as one block.
    pub fn process_block(
        &mut self,
        block: BlockInfo,
        txs: &[Tx],
        oracle: &dyn OracleSource,
        collateral: &dyn CollateralSource,
    ) -> NodeResult<BlockReport> {
        let ctx = BlockContext::new(block, ExecMode::Speculative);
        let mut admitted = Vec::with_capacity(txs.len());
        let mut rejected = Vec::new();
        for tx in txs {
            match self.check_tx(tx, &ctx, oracle, collateral) {
                Ok(()) => admitted.push(tx.clone()),
                Err(e) => rejected.push(Self::rejection(tx.order_id(), ExecMode::Speculative, e)?),
            }
        }

        let mut report = self.execute_block(block, &admitted, oracle, collateral)?;
        rejected.append(&mut report.rejected);
        report.rejected = rejected;
        Ok(report)
    }

    /// Turn a recoverable error into a `Rejection`; pass fatal ones through.
    fn rejection(order_id: &OrderId, phase: ExecMode, err: NodeError) -> NodeResult<Rejection> {
        let Some(reason) = err.reject_reason().cloned() else {
            error!(
                order_id = %order_id,
                phase = %phase,
                error = %err,
                "Fatal error, aborting block"
            );
            return Err(err);
        };
        Metrics::admission_rejected(reason.as_str(), &phase.to_string());
        debug!(order_id = %order_id, phase = %phase, reason = %reason, "Request rejected");
        Ok(Rejection {
            order_id: order_id.clone(),
            phase,
            reason,
        })
    }

    // ------------------------------------------------------------------
    // Speculative phase
    // ------------------------------------------------------------------

    /// Validate a request against committed state.
    ///
    /// Only rate limiters and the speculative order counts change.
    pub fn check_tx(
        &self,
        tx: &Tx,
        ctx: &BlockContext,
        oracle: &dyn OracleSource,
        collateral: &dyn CollateralSource,
    ) -> NodeResult<()> {
        match tx {
            Tx::Place(order) => {
                self.rate_limiters
                    .check_place(ctx.mode, order, ctx.block.height)?;
                self.check_order(&self.keeper, ctx, order, collateral)?;
                if order.order_id.is_conditional() {
                    self.keeper.check_conditional(order, oracle)?;
                }
                if order.is_stateful() {
                    self.uncommitted.record_placement(&order.order_id);
                }
            }
            Tx::Cancel(order_id) => {
                self.rate_limiters
                    .check_cancel(ctx.mode, order_id, ctx.block.height)?;
                if order_id.is_stateful() {
                    let known =
                        self.keeper.is_live(order_id)? || self.uncommitted.contains(order_id);
                    if !known {
                        return Err(RejectReason::InvalidOrder(format!(
                            "order {order_id} does not exist"
                        ))
                        .into());
                    }
                    self.uncommitted.record_cancellation(order_id);
                }
            }
        }
        Ok(())
    }

    /// Checks shared by both phases: structure, market, expiry bounds, TWAP
    /// shape and the equity tier limit. Anything one phase rejects without
    /// looking at the block's own requests, the other rejects too.
    fn check_order(
        &self,
        keeper: &ClobKeeper<MemStore>,
        ctx: &BlockContext,
        order: &Order,
        collateral: &dyn CollateralSource,
    ) -> NodeResult<OrderbookInfo> {
        order
            .validate()
            .map_err(|e| RejectReason::InvalidOrder(e.to_string()))?;
        let book = self.matching.orderbook(order.clob_pair_id()).ok_or_else(|| {
            RejectReason::InvalidOrder(format!("unknown market {}", order.clob_pair_id()))
        })?;
        if order.is_stateful() {
            keeper.check_stateful(order, &ctx.block, book.subticks_per_tick)?;
        }

        if let GoodTil::Block(last) = order.good_til {
            let height = ctx.block.height;
            let max = height.saturating_add(self.config.short_block_window);
            if last < height || last > max {
                return Err(RejectReason::InvalidOrder(format!(
                    "good_til_block {last} outside [{height}, {max}]"
                ))
                .into());
            }
        }

        // Replacing an existing stateful order does not add to the open count.
        if order.is_stateful() && keeper.is_live(&order.order_id)? {
            return Ok(book);
        }

        let subaccount = order.subaccount_id();
        let open = if order.is_stateful() {
            i64::from(
                self.matching
                    .count_resting_orders(subaccount, OrderFilter::Stateful),
            ) + keeper.untriggered_count(subaccount) as i64
                + keeper.twap_parent_count(subaccount) as i64
                + pending_stateful_count(ctx, &self.uncommitted, subaccount)
        } else {
            i64::from(
                self.matching
                    .count_resting_orders(subaccount, OrderFilter::ShortTerm),
            )
        };
        self.config.equity_tiers.check_admission(
            order,
            collateral.net_collateral(subaccount),
            open,
        )?;
        Ok(book)
    }

    // ------------------------------------------------------------------
    // Committed phase
    // ------------------------------------------------------------------

    /// Execute `txs` as block `block`.
    ///
    /// Rejections are reported and skipped. A fatal error leaves the committed
    /// keeper and snapshot at the previous block; the matching engine is not
    /// rolled back, so the caller must stop.
    ///
    /// Either way every request in `txs` is settled afterwards: whatever
    /// `check_tx` recorded for it is dropped from the speculative counts.
    pub fn execute_block(
        &mut self,
        block: BlockInfo,
        txs: &[Tx],
        oracle: &dyn OracleSource,
        collateral: &dyn CollateralSource,
    ) -> NodeResult<BlockReport> {
        let result = self.run_block(block, txs, oracle, collateral);
        self.uncommitted.reconcile_block(txs.iter().map(Tx::order_id));
        result
    }

    fn run_block(
        &mut self,
        block: BlockInfo,
        txs: &[Tx],
        oracle: &dyn OracleSource,
        collateral: &dyn CollateralSource,
    ) -> NodeResult<BlockReport> {
        if block.height <= self.last_height {
            return Err(NodeError::Script(format!(
                "block {} does not follow committed height {}",
                block.height, self.last_height
            )));
        }

        let mut working = self.keeper.clone();
        let mut ctx = BlockContext::new(block, ExecMode::Committed);
        let mut report = BlockReport {
            height: block.height,
            ..BlockReport::default()
        };
        let mut to_book: Vec<Order> = Vec::new();

        for tx in txs {
            let result = match tx {
                Tx::Place(order) => self.deliver_place(
                    &mut working,
                    &mut ctx,
                    order,
                    oracle,
                    collateral,
                    &mut to_book,
                    &mut report,
                ),
                Tx::Cancel(order_id) => {
                    self.deliver_cancel(&mut working, &mut ctx, order_id, &mut to_book, &mut report)
                }
            };
            if let Err(e) = result {
                let rejection = Self::rejection(tx.order_id(), ExecMode::Committed, e)?;
                report.rejected.push(rejection);
            }
        }

        // Stateful orders reach the book once every transaction has run.
        for order in &to_book {
            let outcome = self.matching.place_order(order);
            apply_match(&mut working, &ctx, &outcome, &mut report)?;
        }
        ctx.clear_to_be_committed();

        let end = working.end_block(&mut ctx, oracle)?;
        for order_id in &end.expired {
            self.matching.cancel_order(order_id);
        }
        report.expired = end.expired;
        // short-term orders valid through this block cannot match after it
        report
            .expired
            .extend(self.matching.purge_expired_short_term(block.height.saturating_add(1)));
        for order in end.triggered.iter().chain(&end.released_legs) {
            let outcome = self.matching.place_order(order);
            apply_match(&mut working, &ctx, &outcome, &mut report)?;
        }
        report.triggered = end.triggered.into_iter().map(|o| o.order_id).collect();
        report.released_legs = end.released_legs.into_iter().map(|o| o.order_id).collect();
        report.pruned = end.pruned;

        self.commit(working, &report)?;
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver_place(
        &mut self,
        working: &mut ClobKeeper<MemStore>,
        ctx: &mut BlockContext,
        order: &Order,
        oracle: &dyn OracleSource,
        collateral: &dyn CollateralSource,
        to_book: &mut Vec<Order>,
        report: &mut BlockReport,
    ) -> NodeResult<()> {
        self.rate_limiters
            .check_place(ctx.mode, order, ctx.block.height)?;
        let book = self.check_order(working, ctx, order, collateral)?;
        let order_id = &order.order_id;

        if !order.is_stateful() {
            let outcome = self.matching.place_order(order);
            apply_match(working, ctx, &outcome, report)?;
            report.placed.push(order_id.clone());
            return Ok(());
        }

        let placement = working.place_stateful(order, ctx, oracle, book.subticks_per_tick)?;

        if placement.outcome == PlaceOutcome::Replaced {
            if let Some(pos) = to_book.iter().position(|o| &o.order_id == order_id) {
                to_book.remove(pos);
                ctx.adjust_to_be_committed(order.subaccount_id(), -1);
            } else {
                self.matching.cancel_order(order_id);
            }
        }
        if placement.kind == PlacementKind::Book {
            ctx.adjust_to_be_committed(order.subaccount_id(), 1);
            to_book.push(order.clone());
        }
        report.placed.push(order_id.clone());
        Ok(())
    }

    fn deliver_cancel(
        &mut self,
        working: &mut ClobKeeper<MemStore>,
        ctx: &mut BlockContext,
        order_id: &OrderId,
        to_book: &mut Vec<Order>,
        report: &mut BlockReport,
    ) -> NodeResult<()> {
        self.rate_limiters
            .check_cancel(ctx.mode, order_id, ctx.block.height)?;

        if order_id.is_stateful() {
            if working
                .remove_order(order_id, RemovalReason::Cancelled)?
                .is_none()
            {
                return Err(
                    RejectReason::InvalidOrder(format!("order {order_id} does not exist")).into(),
                );
            }
            if let Some(pos) = to_book.iter().position(|o| &o.order_id == order_id) {
                to_book.remove(pos);
                ctx.adjust_to_be_committed(&order_id.subaccount_id, -1);
            } else {
                self.matching.cancel_order(order_id);
            }
        } else if !self.matching.cancel_order(order_id) {
            debug!(order_id = %order_id, "Short-term cancel for order not on the book");
        }
        report.cancelled.push(order_id.clone());
        Ok(())
    }

    fn commit(&mut self, working: ClobKeeper<MemStore>, report: &BlockReport) -> NodeResult<()> {
        if let Some(path) = &self.config.snapshot_path {
            save_snapshot(path, report.height, working.store())?;
        }
        self.keeper = working;
        self.last_height = report.height;
        self.rate_limiters.prune(report.height);

        info!(
            height = report.height,
            placed = report.placed.len(),
            cancelled = report.cancelled.len(),
            rejected = report.rejected.len(),
            fills = report.fills.len(),
            expired = report.expired.len(),
            triggered = report.triggered.len(),
            released = report.released_legs.len(),
            pruned = report.pruned.len(),
            "Block committed"
        );
        Ok(())
    }
}

fn apply_match(
    keeper: &mut ClobKeeper<MemStore>,
    ctx: &BlockContext,
    outcome: &MatchOutcome,
    report: &mut BlockReport,
) -> NodeResult<()> {
    for fill in &outcome.fills {
        let applied = keeper.apply_fill(fill, ctx)?;
        report.fills.push(FillReport {
            order_id: fill.order.order_id.clone(),
            total_filled: applied.state.filled,
            removed: applied.removed,
        });
    }
    Ok(())
}
