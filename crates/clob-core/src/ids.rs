//! Order identity.
//!
//! `OrderId` is the composite key every lifecycle component is indexed by. Its
//! state key is a fixed big-endian encoding whose byte order matches the
//! derived `Ord` impl, so sorting in memory and iterating the durable store
//! yield the same sequence on every replica.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};

/// Market (CLOB pair) identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ClobPairId(pub u32);

impl fmt::Display for ClobPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subaccount identifier: owner address plus subaccount number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubaccountId {
    pub owner: String,
    pub number: u32,
}

impl SubaccountId {
    pub fn new(owner: impl Into<String>, number: u32) -> Self {
        Self {
            owner: owner.into(),
            number,
        }
    }

    /// Owner bytes are NUL-terminated in state keys.
    pub fn validate(&self) -> Result<()> {
        if self.owner.is_empty() || self.owner.as_bytes().contains(&0) {
            return Err(CoreError::InvalidKey(format!(
                "subaccount owner must be non-empty and NUL-free: {:?}",
                self.owner
            )));
        }
        Ok(())
    }

    /// Ordered byte key: `owner ++ 0x00 ++ number(be)`.
    pub fn to_state_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.owner.len() + 5);
        self.write_key(&mut key);
        key
    }

    fn write_key(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.owner.as_bytes());
        buf.push(0);
        buf.extend_from_slice(&self.number.to_be_bytes());
    }
}

impl fmt::Display for SubaccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.number)
    }
}

/// Order flavor: which subsystem owns the order's lifecycle.
///
/// Variant order matches the tag order so derived `Ord` agrees with the
/// encoded key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFlavor {
    /// Expires by block height, never persisted.
    ShortTerm,
    Conditional,
    LongTerm,
    TwapParent,
    TwapLeg,
}

impl OrderFlavor {
    /// Tag written into state keys.
    pub const fn tag(self) -> u32 {
        match self {
            Self::ShortTerm => 0,
            Self::Conditional => 32,
            Self::LongTerm => 64,
            Self::TwapParent => 128,
            Self::TwapLeg => 256,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::ShortTerm),
            32 => Ok(Self::Conditional),
            64 => Ok(Self::LongTerm),
            128 => Ok(Self::TwapParent),
            256 => Ok(Self::TwapLeg),
            other => Err(CoreError::InvalidKey(format!("unknown order flavor tag {other}"))),
        }
    }

    #[inline]
    pub fn is_stateful(self) -> bool {
        !matches!(self, Self::ShortTerm)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ShortTerm => "short_term",
            Self::Conditional => "conditional",
            Self::LongTerm => "long_term",
            Self::TwapParent => "twap_parent",
            Self::TwapLeg => "twap_leg",
        }
    }
}

impl fmt::Display for OrderFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite order identifier.
///
/// Field order is the key order: subaccount, market, flavor, client id, leg sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId {
    pub subaccount_id: SubaccountId,
    pub clob_pair_id: ClobPairId,
    pub flavor: OrderFlavor,
    pub client_id: u32,
    /// Leg number for TWAP legs, zero otherwise.
    pub sequence: u32,
}

impl OrderId {
    pub fn new(
        subaccount_id: SubaccountId,
        client_id: u32,
        clob_pair_id: ClobPairId,
        flavor: OrderFlavor,
    ) -> Self {
        Self {
            subaccount_id,
            clob_pair_id,
            flavor,
            client_id,
            sequence: 0,
        }
    }

    /// Id of the `index`-th leg of this TWAP parent.
    pub fn twap_leg(&self, index: u32) -> Self {
        Self {
            flavor: OrderFlavor::TwapLeg,
            sequence: index,
            ..self.clone()
        }
    }

    /// Parent id of a TWAP leg.
    pub fn twap_parent(&self) -> Option<Self> {
        (self.flavor == OrderFlavor::TwapLeg).then(|| Self {
            flavor: OrderFlavor::TwapParent,
            sequence: 0,
            ..self.clone()
        })
    }

    #[inline]
    pub fn is_stateful(&self) -> bool {
        self.flavor.is_stateful()
    }

    #[inline]
    pub fn is_conditional(&self) -> bool {
        self.flavor == OrderFlavor::Conditional
    }

    /// Ordered byte key used in every keyspace.
    pub fn to_state_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.subaccount_id.owner.len() + 21);
        self.subaccount_id.write_key(&mut key);
        key.extend_from_slice(&self.clob_pair_id.0.to_be_bytes());
        key.extend_from_slice(&self.flavor.tag().to_be_bytes());
        key.extend_from_slice(&self.client_id.to_be_bytes());
        key.extend_from_slice(&self.sequence.to_be_bytes());
        key
    }

    /// Inverse of [`OrderId::to_state_key`].
    pub fn from_state_key(key: &[u8]) -> Result<Self> {
        let nul = key
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CoreError::InvalidKey("missing owner terminator".to_string()))?;
        let owner = std::str::from_utf8(&key[..nul])
            .map_err(|e| CoreError::InvalidKey(format!("owner is not utf-8: {e}")))?
            .to_string();
        let rest = &key[nul + 1..];
        if rest.len() != 20 {
            return Err(CoreError::InvalidKey(format!(
                "expected 20 trailing bytes, got {}",
                rest.len()
            )));
        }
        let word = |i: usize| u32::from_be_bytes([rest[i], rest[i + 1], rest[i + 2], rest[i + 3]]);
        Ok(Self {
            subaccount_id: SubaccountId::new(owner, word(0)),
            clob_pair_id: ClobPairId(word(4)),
            flavor: OrderFlavor::from_tag(word(8))?,
            client_id: word(12),
            sequence: word(16),
        })
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.subaccount_id, self.clob_pair_id, self.flavor, self.client_id
        )?;
        if self.flavor == OrderFlavor::TwapLeg {
            write!(f, "#{}", self.sequence)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(owner: &str, number: u32, client_id: u32, flavor: OrderFlavor) -> OrderId {
        OrderId::new(SubaccountId::new(owner, number), client_id, ClobPairId(0), flavor)
    }

    #[test]
    fn test_state_key_decodes_back() {
        let leg = id("alice", 3, 7, OrderFlavor::TwapParent).twap_leg(4);
        let decoded = OrderId::from_state_key(&leg.to_state_key()).unwrap();
        assert_eq!(decoded, leg);
    }

    #[test]
    fn test_key_order_matches_derived_ord() {
        let mut ids = vec![
            id("bob", 0, 1, OrderFlavor::LongTerm),
            id("alice", 1, 0, OrderFlavor::LongTerm),
            id("alice", 0, 9, OrderFlavor::Conditional),
            id("alicea", 0, 0, OrderFlavor::ShortTerm),
            id("alice", 0, 2, OrderFlavor::TwapParent).twap_leg(2),
            id("alice", 0, 2, OrderFlavor::TwapParent).twap_leg(1),
        ];
        let mut by_key = ids.clone();
        ids.sort();
        by_key.sort_by_key(OrderId::to_state_key);
        assert_eq!(ids, by_key);
    }

    #[test]
    fn test_twap_leg_parent_roundtrip() {
        let parent = id("carl", 0, 5, OrderFlavor::TwapParent);
        let leg = parent.twap_leg(3);
        assert_eq!(leg.flavor, OrderFlavor::TwapLeg);
        assert_eq!(leg.sequence, 3);
        assert_eq!(leg.twap_parent(), Some(parent.clone()));
        assert_eq!(parent.twap_parent(), None);
    }

    #[test]
    fn test_owner_with_nul_rejected() {
        assert!(SubaccountId::new("a\0b", 0).validate().is_err());
        assert!(SubaccountId::new("", 0).validate().is_err());
        assert!(SubaccountId::new("alice", 0).validate().is_ok());
    }

    #[test]
    fn test_short_term_is_not_stateful() {
        assert!(!OrderFlavor::ShortTerm.is_stateful());
        assert!(OrderFlavor::LongTerm.is_stateful());
        assert!(OrderFlavor::TwapLeg.is_stateful());
    }
}
