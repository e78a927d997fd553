//! Fill ledger.
//!
//! Tracks how much of each order has executed, with deferred pruning keyed by
//! block height.
//!
//! # Durable record vs mirror
//!
//! - Durable: `fill/{order_id}` and `prune/{height}` in the store. Survives restart.
//! - Mirror: `BTreeMap<OrderId, FillState>` rebuilt by [`FillLedger::rehydrate`].
//!
//! Every write goes to both in the same call. Reads are served from the mirror
//! only, so touching the ledger before rehydration is a broken contract
//! (`InvariantViolation::FillsNotHydrated`), not a miss.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use clob_core::{BaseQuantums, InvariantViolation, OrderId};
use clob_store::{codec, prefix_end, KvStore};
use clob_telemetry::Metrics;

use crate::error::KeeperResult;
use crate::keys::{self, FILL_PREFIX, PRUNE_PREFIX};

/// Fill progress of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillState {
    pub filled: BaseQuantums,
    /// First height at which the prune sweep may delete this record.
    pub prunable_after: u32,
}

#[derive(Debug, Clone, Default)]
pub struct FillLedger {
    mirror: BTreeMap<OrderId, FillState>,
    hydrated: bool,
}

impl FillLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Rebuild the mirror from the durable store.
    pub fn rehydrate<S: KvStore>(&mut self, store: &S) -> KeeperResult<usize> {
        self.mirror.clear();
        for (key, value) in store.prefix(FILL_PREFIX) {
            let order_id = decode_order_id(keys::suffix(&key, FILL_PREFIX))?;
            let state: FillState = codec::decode(&value)?;
            self.mirror.insert(order_id, state);
        }
        self.hydrated = true;
        info!(fills = self.mirror.len(), "Fill ledger rehydrated");
        Ok(self.mirror.len())
    }

    fn ensure_hydrated(&self) -> Result<(), InvariantViolation> {
        if !self.hydrated {
            return Err(InvariantViolation::FillsNotHydrated);
        }
        Ok(())
    }

    /// Record the cumulative fill of an order.
    ///
    /// `prunable_after` never moves backwards: a lower value keeps the stored one.
    pub fn record_fill<S: KvStore>(
        &mut self,
        store: &mut S,
        order_id: &OrderId,
        filled: BaseQuantums,
        prunable_after: u32,
    ) -> KeeperResult<FillState> {
        self.ensure_hydrated()?;

        let mut state = FillState {
            filled,
            prunable_after,
        };
        if let Some(existing) = self.mirror.get(order_id) {
            if existing.prunable_after > prunable_after {
                warn!(
                    order_id = %order_id,
                    stored = existing.prunable_after,
                    requested = prunable_after,
                    "Fill prunable_after would decrease, keeping stored value"
                );
                state.prunable_after = existing.prunable_after;
            }
        }

        store.set(keys::fill_key(order_id), codec::encode(&state)?);
        self.mirror.insert(order_id.clone(), state);
        debug!(
            order_id = %order_id,
            filled = %state.filled,
            prunable_after = state.prunable_after,
            "Fill recorded"
        );
        Ok(state)
    }

    pub fn get_fill(&self, order_id: &OrderId) -> KeeperResult<Option<FillState>> {
        self.ensure_hydrated()?;
        Ok(self.mirror.get(order_id).copied())
    }

    /// Delete a fill record. Returns whether it existed.
    pub fn remove_fill<S: KvStore>(
        &mut self,
        store: &mut S,
        order_id: &OrderId,
    ) -> KeeperResult<bool> {
        self.ensure_hydrated()?;
        store.delete(&keys::fill_key(order_id));
        Ok(self.mirror.remove(order_id).is_some())
    }

    /// Add ids to the prune bucket for `height`.
    pub fn schedule_pruning<S: KvStore>(
        &mut self,
        store: &mut S,
        order_ids: &[OrderId],
        height: u32,
    ) -> KeeperResult<()> {
        self.ensure_hydrated()?;
        if order_ids.is_empty() {
            return Ok(());
        }

        let key = keys::prune_key(height);
        let mut bucket: Vec<OrderId> = match store.get(&key) {
            Some(bytes) => codec::decode(&bytes)?,
            None => Vec::new(),
        };
        bucket.extend_from_slice(order_ids);
        bucket.sort();
        bucket.dedup();
        store.set(key, codec::encode(&bucket)?);
        Ok(())
    }

    /// Consume every prune bucket at or below `height`.
    ///
    /// A record whose `prunable_after` moved past `height` since it was scheduled
    /// is kept. Records already gone are skipped. Returns the ids removed.
    pub fn sweep<S: KvStore>(&mut self, store: &mut S, height: u32) -> KeeperResult<Vec<OrderId>> {
        self.ensure_hydrated()?;

        let end = match height.checked_add(1) {
            Some(next) => Some(keys::prune_key(next)),
            None => prefix_end(PRUNE_PREFIX),
        };
        let buckets = store.range(PRUNE_PREFIX, end.as_deref());

        let mut removed = Vec::new();
        for (key, value) in buckets {
            let bucket: Vec<OrderId> = codec::decode(&value)?;
            for order_id in bucket {
                let Some(state) = self.mirror.get(&order_id) else {
                    continue;
                };
                if state.prunable_after > height {
                    warn!(
                        order_id = %order_id,
                        prunable_after = state.prunable_after,
                        height,
                        "Fill retention extended past scheduled prune height, skipping"
                    );
                    Metrics::prune_retention_extended();
                    continue;
                }
                store.delete(&keys::fill_key(&order_id));
                self.mirror.remove(&order_id);
                removed.push(order_id);
            }
            store.delete(&key);
        }

        if !removed.is_empty() {
            Metrics::fills_pruned(removed.len());
            debug!(height, pruned = removed.len(), "Fills pruned");
        }
        Ok(removed)
    }

    /// Every fill record in key order.
    pub fn all_fills(&self) -> KeeperResult<Vec<(OrderId, FillState)>> {
        self.ensure_hydrated()?;
        Ok(self
            .mirror
            .iter()
            .map(|(id, state)| (id.clone(), *state))
            .collect())
    }
}

/// Keys the store handed back must decode; anything else is corruption.
pub(crate) fn decode_order_id(bytes: &[u8]) -> Result<OrderId, InvariantViolation> {
    OrderId::from_state_key(bytes)
        .map_err(|e| InvariantViolation::Corrupt(format!("order id key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeeperError;
    use clob_core::{ClobPairId, OrderFlavor, SubaccountId};
    use clob_store::MemStore;
    use proptest::prelude::*;

    fn oid(client_id: u32) -> OrderId {
        OrderId::new(
            SubaccountId::new("alice", 0),
            client_id,
            ClobPairId(0),
            OrderFlavor::ShortTerm,
        )
    }

    fn hydrated() -> (FillLedger, MemStore) {
        let store = MemStore::new();
        let mut ledger = FillLedger::new();
        ledger.rehydrate(&store).unwrap();
        (ledger, store)
    }

    #[test]
    fn test_read_before_rehydrate_is_fatal() {
        let ledger = FillLedger::new();
        let err = ledger.get_fill(&oid(1)).unwrap_err();
        assert!(matches!(
            err,
            KeeperError::Invariant(InvariantViolation::FillsNotHydrated)
        ));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_record_and_rehydrate() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(5), 30)
            .unwrap();

        let mut restarted = FillLedger::new();
        assert_eq!(restarted.rehydrate(&store).unwrap(), 1);
        assert_eq!(
            restarted.get_fill(&oid(1)).unwrap(),
            Some(FillState {
                filled: BaseQuantums(5),
                prunable_after: 30
            })
        );
    }

    #[test]
    fn test_prunable_after_never_decreases() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(5), 30)
            .unwrap();
        let state = ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(8), 20)
            .unwrap();
        assert_eq!(state.filled, BaseQuantums(8));
        assert_eq!(state.prunable_after, 30);
    }

    #[test]
    fn test_schedule_dedups_and_sorts() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .schedule_pruning(&mut store, &[oid(3), oid(1)], 10)
            .unwrap();
        ledger
            .schedule_pruning(&mut store, &[oid(1), oid(2)], 10)
            .unwrap();
        let bucket: Vec<OrderId> =
            codec::decode(&store.get(&keys::prune_key(10)).unwrap()).unwrap();
        assert_eq!(bucket, vec![oid(1), oid(2), oid(3)]);
    }

    #[test]
    fn test_sweep_skips_extended_and_missing() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(1), 10)
            .unwrap();
        ledger
            .record_fill(&mut store, &oid(2), BaseQuantums(1), 10)
            .unwrap();
        ledger
            .schedule_pruning(&mut store, &[oid(1), oid(2), oid(3)], 10)
            .unwrap();
        // oid(2) gets a later fill that pushes its retention out
        ledger
            .record_fill(&mut store, &oid(2), BaseQuantums(2), 40)
            .unwrap();

        let removed = ledger.sweep(&mut store, 10).unwrap();
        assert_eq!(removed, vec![oid(1)]);
        assert!(ledger.get_fill(&oid(1)).unwrap().is_none());
        assert!(ledger.get_fill(&oid(2)).unwrap().is_some());
        assert!(store.get(&keys::prune_key(10)).is_none());
    }

    #[test]
    fn test_sweep_consumes_older_buckets() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(1), 4)
            .unwrap();
        ledger.schedule_pruning(&mut store, &[oid(1)], 4).unwrap();
        ledger.schedule_pruning(&mut store, &[oid(9)], 12).unwrap();

        assert_eq!(ledger.sweep(&mut store, 7).unwrap(), vec![oid(1)]);
        assert!(store.get(&keys::prune_key(12)).is_some());
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(1), 5)
            .unwrap();
        ledger.schedule_pruning(&mut store, &[oid(1)], 5).unwrap();
        assert_eq!(ledger.sweep(&mut store, 5).unwrap().len(), 1);
        let snapshot = store.clone();
        assert!(ledger.sweep(&mut store, 5).unwrap().is_empty());
        assert_eq!(store, snapshot);
    }

    #[test]
    fn test_sweep_at_max_height() {
        let (mut ledger, mut store) = hydrated();
        ledger
            .record_fill(&mut store, &oid(1), BaseQuantums(1), 3)
            .unwrap();
        ledger.schedule_pruning(&mut store, &[oid(1)], 3).unwrap();
        assert_eq!(ledger.sweep(&mut store, u32::MAX).unwrap(), vec![oid(1)]);
    }

    proptest! {
        #[test]
        fn prop_retention_is_monotonic(writes in prop::collection::vec(0u32..1_000, 1..20)) {
            let (mut ledger, mut store) = hydrated();
            let mut high = 0;
            for (i, prunable_after) in writes.into_iter().enumerate() {
                let state = ledger
                    .record_fill(&mut store, &oid(1), BaseQuantums(i as u64 + 1), prunable_after)
                    .unwrap();
                high = high.max(prunable_after);
                prop_assert_eq!(state.prunable_after, high);
            }
        }
    }
}
