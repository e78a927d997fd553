//! The two error classes shared by every lifecycle crate.
//!
//! - `RejectReason`: an expected, recoverable admission rejection. Returned to
//!   the submitter, no state is mutated.
//! - `InvariantViolation`: a programming-contract violation. The replicated
//!   state machine has diverged from its invariants and the enclosing block
//!   must be aborted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{ClobPairId, OrderId, SubaccountId};
use crate::quantums::{BaseQuantums, Subticks};

/// Reason an order or cancellation was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum RejectReason {
    #[error("order would exceed equity tier limit of {limit} open orders (currently {open})")]
    EquityTierLimitExceeded { limit: u32, open: i64 },

    #[error("rate of {rate} exceeds configured block rate limit of {limit} over {num_blocks} blocks")]
    BlockRateLimitExceeded {
        rate: u32,
        limit: u32,
        num_blocks: u32,
    },

    #[error("conditional order with trigger {trigger} would fire immediately at oracle {oracle}")]
    WouldTriggerImmediately { trigger: Subticks, oracle: Subticks },

    #[error("invalid twap order: {0}")]
    InvalidTwap(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

impl RejectReason {
    /// Stable label for metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EquityTierLimitExceeded { .. } => "equity_tier",
            Self::BlockRateLimitExceeded { .. } => "block_rate_limit",
            Self::WouldTriggerImmediately { .. } => "would_trigger_immediately",
            Self::InvalidTwap(_) => "invalid_twap",
            Self::InvalidOrder(_) => "invalid_order",
        }
    }
}

/// A broken lifecycle contract. Always fatal for the current block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("stateful-only operation called with short-term order {0}")]
    NotStateful(OrderId),

    #[error("conditional-only operation called with order {0}")]
    NotConditional(OrderId),

    #[error("order {order_id} already present in expiration bucket {at}")]
    DuplicateExpiration { order_id: OrderId, at: i64 },

    #[error("order {order_id} missing from expiration bucket {at}")]
    MissingExpiration { order_id: OrderId, at: i64 },

    #[error("order {0} does not exist")]
    MissingOrder(OrderId),

    #[error("conditional order {0} is not in untriggered state")]
    MissingUntriggered(OrderId),

    #[error("both trigger directions fired in one poll for market {market} (lte={lte}, gte={gte})")]
    BothDirectionsTriggered {
        market: ClobPairId,
        lte: usize,
        gte: usize,
    },

    #[error("negative open order count {count} for subaccount {subaccount}")]
    NegativeOpenCount { subaccount: SubaccountId, count: i64 },

    #[error("fill mirror read before rehydration")]
    FillsNotHydrated,

    #[error("twap parent {order_id} remaining {remaining} cannot absorb fill of {filled}")]
    TwapQuantityUnderflow {
        order_id: OrderId,
        remaining: BaseQuantums,
        filled: BaseQuantums,
    },

    #[error("corrupt state: {0}")]
    Corrupt(String),
}
