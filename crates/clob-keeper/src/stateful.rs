//! Stateful order store.
//!
//! Durable placement records for orders that outlive a single block. Conditional
//! orders sit in the untriggered keyspace until [`StatefulOrderStore::trigger`]
//! moves them to the placed keyspace; only placed orders are handed back by
//! [`StatefulOrderStore::list_all`] to warm-start the book.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

use clob_core::{InvariantViolation, Order, OrderFlavor, OrderId, SubaccountId};
use clob_store::{codec, KvStore};
use clob_telemetry::Metrics;

use crate::context::BlockContext;
use crate::error::KeeperResult;
use crate::fills::decode_order_id;
use crate::keys::{self, PLACED_PREFIX, UNTRIGGERED_PREFIX};

/// Position of a placement in the committed transaction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionOrdering {
    pub block_height: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulOrderPlacement {
    pub order: Order,
    pub ordering: TransactionOrdering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceOutcome {
    Created,
    /// An order with the same id was overwritten.
    Replaced,
}

impl PlaceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Replaced => "replaced",
        }
    }
}

/// Placement records plus the per-subaccount stateful order count.
#[derive(Debug, Clone, Default)]
pub struct StatefulOrderStore {
    counts: BTreeMap<SubaccountId, u32>,
}

impl StatefulOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the per-subaccount counts from both keyspaces.
    pub fn rehydrate<S: KvStore>(&mut self, store: &S) -> KeeperResult<()> {
        self.counts.clear();
        for prefix in [PLACED_PREFIX, UNTRIGGERED_PREFIX] {
            for (key, _) in store.prefix(prefix) {
                let order_id = decode_order_id(keys::suffix(&key, prefix))?;
                if counts_toward_limit(&order_id) {
                    *self.counts.entry(order_id.subaccount_id).or_insert(0) += 1;
                }
            }
        }
        info!(subaccounts = self.counts.len(), "Stateful order counts rebuilt");
        Ok(())
    }

    /// Write a placement record with the next sequence number of the block.
    pub fn place<S: KvStore>(
        &mut self,
        store: &mut S,
        order: &Order,
        ctx: &mut BlockContext,
    ) -> KeeperResult<(StatefulOrderPlacement, PlaceOutcome)> {
        order.must_be_stateful()?;

        let placement = StatefulOrderPlacement {
            order: order.clone(),
            ordering: TransactionOrdering {
                block_height: ctx.block.height,
                sequence: ctx.next_sequence(),
            },
        };

        let placed_key = keys::placed_key(&order.order_id);
        let untriggered_key = keys::untriggered_key(&order.order_id);
        let existed = store.delete(&placed_key) | store.delete(&untriggered_key);

        let key = if order.order_id.is_conditional() {
            untriggered_key
        } else {
            placed_key
        };
        store.set(key, codec::encode(&placement)?);

        let outcome = if existed {
            PlaceOutcome::Replaced
        } else {
            if counts_toward_limit(&order.order_id) {
                *self
                    .counts
                    .entry(order.subaccount_id().clone())
                    .or_insert(0) += 1;
            }
            PlaceOutcome::Created
        };

        Metrics::stateful_order_placed(order.flavor().as_str(), outcome.as_str());
        debug!(
            order_id = %order.order_id,
            height = placement.ordering.block_height,
            sequence = placement.ordering.sequence,
            outcome = outcome.as_str(),
            "Stateful order placed"
        );
        Ok((placement, outcome))
    }

    /// Placement record from either keyspace.
    pub fn get<S: KvStore>(
        &self,
        store: &S,
        order_id: &OrderId,
    ) -> KeeperResult<Option<StatefulOrderPlacement>> {
        let bytes = store
            .get(&keys::placed_key(order_id))
            .or_else(|| store.get(&keys::untriggered_key(order_id)));
        match bytes {
            Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether the order is waiting on its trigger.
    pub fn is_untriggered<S: KvStore>(&self, store: &S, order_id: &OrderId) -> bool {
        store.has(&keys::untriggered_key(order_id))
    }

    /// Delete a placement from either keyspace. Idempotent.
    pub fn delete<S: KvStore>(&mut self, store: &mut S, order_id: &OrderId) -> bool {
        let existed = store.delete(&keys::placed_key(order_id))
            | store.delete(&keys::untriggered_key(order_id));
        if existed && counts_toward_limit(order_id) {
            match self.counts.get_mut(&order_id.subaccount_id) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&order_id.subaccount_id);
                    }
                }
                _ => error!(
                    order_id = %order_id,
                    "Stateful order count underflow, leaving count unchanged"
                ),
            }
        }
        existed
    }

    /// Move an untriggered conditional order to the placed keyspace under a
    /// fresh sequence number.
    pub fn trigger<S: KvStore>(
        &mut self,
        store: &mut S,
        order_id: &OrderId,
        ctx: &mut BlockContext,
    ) -> KeeperResult<StatefulOrderPlacement> {
        let key = keys::untriggered_key(order_id);
        let bytes = store
            .get(&key)
            .ok_or_else(|| InvariantViolation::MissingUntriggered(order_id.clone()))?;
        let mut placement: StatefulOrderPlacement = codec::decode(&bytes)?;
        placement.ordering = TransactionOrdering {
            block_height: ctx.block.height,
            sequence: ctx.next_sequence(),
        };

        store.delete(&key);
        store.set(keys::placed_key(order_id), codec::encode(&placement)?);
        Metrics::stateful_order_placed(order_id.flavor.as_str(), "triggered");
        Ok(placement)
    }

    /// Placed orders sorted by `(block_height, sequence)`.
    pub fn list_all<S: KvStore>(&self, store: &S) -> KeeperResult<Vec<StatefulOrderPlacement>> {
        let mut placements = decode_all(store, PLACED_PREFIX)?;
        placements.sort_by_key(|p| p.ordering);
        Ok(placements)
    }

    /// Untriggered conditional orders sorted by `(block_height, sequence)`.
    pub fn list_untriggered<S: KvStore>(
        &self,
        store: &S,
    ) -> KeeperResult<Vec<StatefulOrderPlacement>> {
        let mut placements = decode_all(store, UNTRIGGERED_PREFIX)?;
        placements.sort_by_key(|p| p.ordering);
        Ok(placements)
    }

    /// Untriggered conditional orders owned by one subaccount.
    pub fn untriggered_count<S: KvStore>(&self, store: &S, subaccount: &SubaccountId) -> usize {
        let prefix = keys::untriggered_subaccount_prefix(subaccount);
        store.prefix(&prefix).len()
    }

    /// Stateful orders (TWAP legs excluded) currently recorded for a subaccount.
    pub fn stateful_count(&self, subaccount: &SubaccountId) -> u32 {
        self.counts.get(subaccount).copied().unwrap_or(0)
    }
}

fn counts_toward_limit(order_id: &OrderId) -> bool {
    order_id.flavor != OrderFlavor::TwapLeg
}

fn decode_all<S: KvStore>(store: &S, prefix: &[u8]) -> KeeperResult<Vec<StatefulOrderPlacement>> {
    store
        .prefix(prefix)
        .into_iter()
        .map(|(_, value)| Ok(codec::decode(&value)?))
        .collect()
}
