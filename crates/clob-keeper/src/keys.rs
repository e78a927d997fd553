//! Keyspace layout.
//!
//! Each lifecycle keyspace is a prefix inside the durable store. Suffixes are
//! the fixed-width encodings from `clob_store::codec` and `OrderId::to_state_key`.

use chrono::{DateTime, Utc};
use clob_core::{ClobPairId, OrderId, SubaccountId};
use clob_store::codec;

/// `fill/{order_id}` -> `FillState`
pub const FILL_PREFIX: &[u8] = b"fill/";
/// `prune/{height}` -> sorted `Vec<OrderId>`
pub const PRUNE_PREFIX: &[u8] = b"prune/";
/// `order/placed/{order_id}` -> `StatefulOrderPlacement`
pub const PLACED_PREFIX: &[u8] = b"order/placed/";
/// `order/untriggered/{order_id}` -> `StatefulOrderPlacement`
pub const UNTRIGGERED_PREFIX: &[u8] = b"order/untriggered/";
/// `expiry/{time}` -> sorted `Vec<OrderId>`
pub const EXPIRATION_PREFIX: &[u8] = b"expiry/";
/// `twap/parent/{order_id}` -> `TwapOrderPlacement`
pub const TWAP_PARENT_PREFIX: &[u8] = b"twap/parent/";
/// `twap/trigger/{time}{leg_id}` -> leg `Order`
pub const TWAP_TRIGGER_PREFIX: &[u8] = b"twap/trigger/";

/// `trigger/price/{market}` -> last polled oracle price
pub const TRIGGER_PRICE_PREFIX: &[u8] = b"trigger/price/";

/// Every durable keyspace, in dump order.
pub const ALL_PREFIXES: [(&str, &[u8]); 8] = [
    ("fills", FILL_PREFIX),
    ("prune", PRUNE_PREFIX),
    ("placed", PLACED_PREFIX),
    ("untriggered", UNTRIGGERED_PREFIX),
    ("expirations", EXPIRATION_PREFIX),
    ("twap_parents", TWAP_PARENT_PREFIX),
    ("twap_triggers", TWAP_TRIGGER_PREFIX),
    ("trigger_prices", TRIGGER_PRICE_PREFIX),
];

pub fn fill_key(order_id: &OrderId) -> Vec<u8> {
    codec::join(FILL_PREFIX, &[&order_id.to_state_key()])
}

pub fn prune_key(height: u32) -> Vec<u8> {
    codec::join(PRUNE_PREFIX, &[&codec::height_key(height)])
}

pub fn placed_key(order_id: &OrderId) -> Vec<u8> {
    codec::join(PLACED_PREFIX, &[&order_id.to_state_key()])
}

pub fn untriggered_key(order_id: &OrderId) -> Vec<u8> {
    codec::join(UNTRIGGERED_PREFIX, &[&order_id.to_state_key()])
}

/// Every untriggered order of one subaccount shares this prefix.
pub fn untriggered_subaccount_prefix(subaccount: &SubaccountId) -> Vec<u8> {
    codec::join(UNTRIGGERED_PREFIX, &[&subaccount.to_state_key()])
}

pub fn expiration_key(at: &DateTime<Utc>) -> Vec<u8> {
    codec::join(EXPIRATION_PREFIX, &[&codec::time_key(at)])
}

pub fn twap_parent_key(order_id: &OrderId) -> Vec<u8> {
    codec::join(TWAP_PARENT_PREFIX, &[&order_id.to_state_key()])
}

/// Every TWAP parent of one subaccount shares this prefix.
pub fn twap_parent_subaccount_prefix(subaccount: &SubaccountId) -> Vec<u8> {
    codec::join(TWAP_PARENT_PREFIX, &[&subaccount.to_state_key()])
}

/// Trigger-time first, then leg id bytes: a total order across parents.
pub fn twap_trigger_key(at: &DateTime<Utc>, leg_id: &OrderId) -> Vec<u8> {
    codec::join(
        TWAP_TRIGGER_PREFIX,
        &[&codec::time_key(at), &leg_id.to_state_key()],
    )
}

pub fn trigger_price_key(market: ClobPairId) -> Vec<u8> {
    codec::join(TRIGGER_PRICE_PREFIX, &[&market.0.to_be_bytes()])
}

/// Strip a known prefix from a key read back from the store.
pub fn suffix<'a>(key: &'a [u8], prefix: &[u8]) -> &'a [u8] {
    key.strip_prefix(prefix).unwrap_or(key)
}
