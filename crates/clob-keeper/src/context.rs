//! Per-block transient state and phase-scoped order counters.
//!
//! Nothing here is process-wide: the block-processing code owns a
//! [`BlockContext`] for the block it is executing and passes it down, and the
//! node owns one [`UncommittedOrderCounts`] shared by speculative checks.
//!
//! # Two counters for one quantity
//!
//! "Stateful orders known but not yet resting" is tracked twice:
//! - **Committed phase** uses `BlockContext::to_be_committed`, seeded from the
//!   block's own transactions and reset at every block boundary.
//! - **Speculative phase** uses [`UncommittedOrderCounts`], seeded from what
//!   this node has independently accepted and reconciled as blocks commit.
//!
//! Reading the wrong one is a correctness bug, so both are reached only
//! through [`pending_stateful_count`].

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use clob_core::{BlockInfo, ExecMode, OrderId, SubaccountId};

/// Transient state of the block being executed.
#[derive(Debug, Clone)]
pub struct BlockContext {
    pub block: BlockInfo,
    pub mode: ExecMode,
    next_sequence: u32,
    to_be_committed: HashMap<SubaccountId, i64>,
}

impl BlockContext {
    /// Fresh context at a block boundary: sequence and counters start at zero.
    pub fn new(block: BlockInfo, mode: ExecMode) -> Self {
        Self {
            block,
            mode,
            next_sequence: 0,
            to_be_committed: HashMap::new(),
        }
    }

    /// Next intra-block sequence number. Strictly increasing, never reused.
    pub fn next_sequence(&mut self) -> u32 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Sequence number the next placement will receive.
    pub fn peek_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Adjust the committed-phase pending count for a subaccount.
    pub fn adjust_to_be_committed(&mut self, subaccount: &SubaccountId, delta: i64) {
        *self
            .to_be_committed
            .entry(subaccount.clone())
            .or_insert(0) += delta;
    }

    pub fn to_be_committed(&self, subaccount: &SubaccountId) -> i64 {
        self.to_be_committed.get(subaccount).copied().unwrap_or(0)
    }

    /// Clear the committed-phase counters once pending orders have been handed
    /// to the matching engine.
    pub fn clear_to_be_committed(&mut self) {
        self.to_be_committed.clear();
    }
}

/// Speculative-phase count of stateful orders accepted locally but not yet
/// seen in a committed block.
///
/// Every recorded placement and cancellation is remembered by id so that a
/// committed block can undo exactly what was recorded for its requests,
/// whether the block accepted or rejected them. Safe to share between
/// concurrent speculative checks.
#[derive(Debug, Default)]
pub struct UncommittedOrderCounts {
    counts: DashMap<SubaccountId, i64>,
    placed: DashMap<OrderId, ()>,
    cancelled: DashMap<OrderId, ()>,
}

impl UncommittedOrderCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subaccount: &SubaccountId) -> i64 {
        self.counts.get(subaccount).map(|c| *c).unwrap_or(0)
    }

    /// A stateful placement passed speculative validation.
    pub fn record_placement(&self, order_id: &OrderId) {
        if self.placed.insert(order_id.clone(), ()).is_none() {
            self.adjust(&order_id.subaccount_id, 1);
        }
    }

    /// A stateful cancellation passed speculative validation.
    ///
    /// Cancelling an order this node placed speculatively undoes that placement;
    /// cancelling a committed order reduces the subaccount's known count.
    pub fn record_cancellation(&self, order_id: &OrderId) {
        if self.placed.remove(order_id).is_some() {
            self.adjust(&order_id.subaccount_id, -1);
        } else if self.cancelled.insert(order_id.clone(), ()).is_none() {
            self.adjust(&order_id.subaccount_id, -1);
        }
    }

    /// Whether a speculative placement for `order_id` is outstanding.
    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.placed.contains_key(order_id)
    }

    /// Undo everything recorded for requests a block has now settled.
    ///
    /// Committed state reflects the accepted ones and the rejected ones never
    /// happened, so in both cases the speculative adjustment is dropped.
    pub fn reconcile_block<'a>(&self, order_ids: impl IntoIterator<Item = &'a OrderId>) {
        let mut settled = 0usize;
        for order_id in order_ids {
            if self.placed.remove(order_id).is_some() {
                self.adjust(&order_id.subaccount_id, -1);
                settled += 1;
            }
            if self.cancelled.remove(order_id).is_some() {
                self.adjust(&order_id.subaccount_id, 1);
                settled += 1;
            }
        }
        self.counts.retain(|_, count| *count != 0);
        debug!(
            settled,
            outstanding = self.placed.len() + self.cancelled.len(),
            "Reconciled uncommitted order counts"
        );
    }

    fn adjust(&self, subaccount: &SubaccountId, delta: i64) {
        *self.counts.entry(subaccount.clone()).or_insert(0) += delta;
    }

    /// Drop everything, e.g. after a restart from snapshot.
    pub fn reset(&self) {
        self.counts.clear();
        self.placed.clear();
        self.cancelled.clear();
    }

    /// Placements accepted speculatively and not yet reconciled.
    pub fn outstanding(&self) -> HashSet<OrderId> {
        self.placed.iter().map(|e| e.key().clone()).collect()
    }
}

/// Phase-appropriate count of stateful orders known but not yet resting.
pub fn pending_stateful_count(
    ctx: &BlockContext,
    uncommitted: &UncommittedOrderCounts,
    subaccount: &SubaccountId,
) -> i64 {
    match ctx.mode {
        ExecMode::Speculative => uncommitted.get(subaccount),
        ExecMode::Committed => ctx.to_be_committed(subaccount),
    }
}
