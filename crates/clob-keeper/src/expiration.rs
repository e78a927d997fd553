//! Expiration index: instant -> sorted, duplicate-free order ids.
//!
//! An order id lives in at most one bucket. Buckets are keyed by whole-second
//! block time, so sweeping is a single ordered range read.

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use clob_core::{InvariantViolation, OrderId};
use clob_store::{codec, prefix_end, KvStore};

use crate::error::KeeperResult;
use crate::keys::{self, EXPIRATION_PREFIX};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpirationIndex;

impl ExpirationIndex {
    pub fn new() -> Self {
        Self
    }

    /// Add an order to the bucket for `at`. Adding it twice is fatal.
    pub fn add_to_slice<S: KvStore>(
        &self,
        store: &mut S,
        at: DateTime<Utc>,
        order_id: &OrderId,
    ) -> KeeperResult<()> {
        let mut bucket = self.list_slice(store, at)?;
        if let Err(pos) = bucket.binary_search(order_id) {
            bucket.insert(pos, order_id.clone());
        } else {
            return Err(InvariantViolation::DuplicateExpiration {
                order_id: order_id.clone(),
                at: at.timestamp(),
            }
            .into());
        }
        write_bucket(store, at, bucket)
    }

    /// Remove an order from the bucket for `at`. A missing entry is fatal.
    pub fn remove_from_slice<S: KvStore>(
        &self,
        store: &mut S,
        at: DateTime<Utc>,
        order_id: &OrderId,
    ) -> KeeperResult<()> {
        let mut bucket = self.list_slice(store, at)?;
        match bucket.binary_search(order_id) {
            Ok(pos) => {
                bucket.remove(pos);
            }
            Err(_) => {
                return Err(InvariantViolation::MissingExpiration {
                    order_id: order_id.clone(),
                    at: at.timestamp(),
                }
                .into())
            }
        }
        write_bucket(store, at, bucket)
    }

    pub fn list_slice<S: KvStore>(
        &self,
        store: &S,
        at: DateTime<Utc>,
    ) -> KeeperResult<Vec<OrderId>> {
        match store.get(&keys::expiration_key(&at)) {
            Some(bytes) => Ok(codec::decode(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    /// Drain every bucket at or before `up_to`.
    ///
    /// Ids come back in bucket-time order, then id order within a bucket.
    pub fn sweep_expired<S: KvStore>(
        &self,
        store: &mut S,
        up_to: DateTime<Utc>,
    ) -> KeeperResult<Vec<OrderId>> {
        let end = match up_to.timestamp().checked_add(1) {
            Some(next) => Utc
                .timestamp_opt(next, 0)
                .single()
                .map(|t| keys::expiration_key(&t)),
            None => None,
        };
        let end = end.or_else(|| prefix_end(EXPIRATION_PREFIX));

        let mut expired = Vec::new();
        for (key, value) in store.range(EXPIRATION_PREFIX, end.as_deref()) {
            let bucket: Vec<OrderId> = codec::decode(&value)?;
            expired.extend(bucket);
            store.delete(&key);
        }
        if !expired.is_empty() {
            debug!(up_to = up_to.timestamp(), expired = expired.len(), "Expiration buckets swept");
        }
        Ok(expired)
    }
}

fn write_bucket<S: KvStore>(
    store: &mut S,
    at: DateTime<Utc>,
    mut bucket: Vec<OrderId>,
) -> KeeperResult<()> {
    let key = keys::expiration_key(&at);
    if bucket.is_empty() {
        store.delete(&key);
        return Ok(());
    }
    bucket.sort();
    bucket.dedup();
    store.set(key, codec::encode(&bucket)?);
    Ok(())
}
