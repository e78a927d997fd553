//! Stable binary encoding.
//!
//! Values are MessagePack (`rmp-serde`, struct-as-array): the same value always
//! produces the same bytes. Keys are fixed-width big-endian so byte order is
//! numeric order.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

const SIGN_BIT: u64 = 1 << 63;

/// Encode a value for storage.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Decode a stored value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Whole-second timestamp key; the sign bit is flipped so pre-epoch
/// instants still sort before post-epoch ones.
pub fn time_key(time: &DateTime<Utc>) -> [u8; 8] {
    ((time.timestamp() as u64) ^ SIGN_BIT).to_be_bytes()
}

/// Inverse of [`time_key`].
pub fn time_from_key(bytes: &[u8]) -> StoreResult<DateTime<Utc>> {
    let raw: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::InvalidKey(format!("time key too short: {}", bytes.len())))?;
    let secs = (u64::from_be_bytes(raw) ^ SIGN_BIT) as i64;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::InvalidKey(format!("timestamp out of range: {secs}")))
}

pub fn height_key(height: u32) -> [u8; 4] {
    height.to_be_bytes()
}

pub fn height_from_key(bytes: &[u8]) -> StoreResult<u32> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::InvalidKey(format!("height key too short: {}", bytes.len())))?;
    Ok(u32::from_be_bytes(raw))
}

/// Concatenate a keyspace prefix with key parts.
pub fn join(prefix: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let len = prefix.len() + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.extend_from_slice(prefix);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}
