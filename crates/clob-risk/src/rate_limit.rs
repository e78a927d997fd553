//! Block rate limiting for admission.
//!
//! Counts requests per subaccount per block height and rejects once the sum
//! over any configured window of recent blocks exceeds its limit. Only the
//! speculative phase is limited: committed execution must accept whatever the
//! block contains, so every call there is a no-op.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use clob_core::{ExecMode, Order, OrderId, RejectReason, SubaccountId};

use crate::error::{RiskError, RiskResult};

/// Largest window accepted in configuration.
pub const MAX_NUM_BLOCKS: u32 = 10_000;

/// At most `limit` requests within the last `num_blocks` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxPerNBlocksRateLimit {
    pub num_blocks: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockRateLimitConfiguration {
    pub max_short_term_orders_per_n_blocks: Vec<MaxPerNBlocksRateLimit>,
    pub max_stateful_orders_per_n_blocks: Vec<MaxPerNBlocksRateLimit>,
    pub max_short_term_order_cancellations_per_n_blocks: Vec<MaxPerNBlocksRateLimit>,
}

impl BlockRateLimitConfiguration {
    pub fn validate(&self) -> RiskResult<()> {
        let groups = [
            ("short_term_orders", &self.max_short_term_orders_per_n_blocks),
            ("stateful_orders", &self.max_stateful_orders_per_n_blocks),
            (
                "short_term_cancellations",
                &self.max_short_term_order_cancellations_per_n_blocks,
            ),
        ];
        for (name, windows) in groups {
            for window in windows.iter() {
                if window.num_blocks == 0 || window.num_blocks > MAX_NUM_BLOCKS {
                    return Err(RiskError::ConfigError(format!(
                        "{name}: num_blocks must be in 1..={MAX_NUM_BLOCKS}, got {}",
                        window.num_blocks
                    )));
                }
                if window.limit == 0 {
                    return Err(RiskError::ConfigError(format!(
                        "{name}: limit must be positive for a {}-block window",
                        window.num_blocks
                    )));
                }
            }
            let mut seen: Vec<u32> = windows.iter().map(|w| w.num_blocks).collect();
            seen.sort_unstable();
            if seen.windows(2).any(|p| p[0] == p[1]) {
                return Err(RiskError::ConfigError(format!(
                    "{name}: duplicate num_blocks window"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counts {
    /// height -> subaccount -> requests seen at that height
    by_height: BTreeMap<u32, HashMap<SubaccountId, u32>>,
}

/// Per-subaccount limiter over one or more block windows.
#[derive(Debug)]
pub struct BlockRateLimiter {
    name: &'static str,
    windows: Vec<MaxPerNBlocksRateLimit>,
    counts: Mutex<Counts>,
}

impl BlockRateLimiter {
    pub fn new(name: &'static str, windows: Vec<MaxPerNBlocksRateLimit>) -> Self {
        Self {
            name,
            windows,
            counts: Mutex::new(Counts::default()),
        }
    }

    fn max_window(&self) -> u32 {
        self.windows.iter().map(|w| w.num_blocks).max().unwrap_or(0)
    }

    /// Count one request at `height` and check every window.
    ///
    /// The request is counted even when it is rejected.
    pub fn rate_limit(
        &self,
        mode: ExecMode,
        subaccount: &SubaccountId,
        height: u32,
    ) -> Result<(), RejectReason> {
        if !mode.is_speculative() || self.windows.is_empty() {
            return Ok(());
        }

        let mut counts = self.counts.lock();
        *counts
            .by_height
            .entry(height)
            .or_default()
            .entry(subaccount.clone())
            .or_insert(0) += 1;

        for window in &self.windows {
            let start = height.saturating_sub(window.num_blocks - 1);
            let rate: u32 = counts
                .by_height
                .range(start..=height)
                .filter_map(|(_, subs)| subs.get(subaccount))
                .sum();
            if rate > window.limit {
                debug!(
                    limiter = self.name,
                    subaccount = %subaccount,
                    height,
                    rate,
                    limit = window.limit,
                    num_blocks = window.num_blocks,
                    "Block rate limit exceeded"
                );
                return Err(RejectReason::BlockRateLimitExceeded {
                    rate,
                    limit: window.limit,
                    num_blocks: window.num_blocks,
                });
            }
        }
        Ok(())
    }

    /// Forget heights that no window can reach from `height` onward.
    pub fn prune(&self, height: u32) {
        let max = self.max_window();
        let mut counts = self.counts.lock();
        if max == 0 {
            counts.by_height.clear();
            return;
        }
        let keep_from = height.saturating_sub(max - 1);
        counts.by_height = counts.by_height.split_off(&keep_from);
    }

    /// Heights currently tracked.
    pub fn tracked_heights(&self) -> usize {
        self.counts.lock().by_height.len()
    }
}

/// The three limiters applied at admission.
#[derive(Debug)]
pub struct ClobRateLimiters {
    short_term_orders: BlockRateLimiter,
    stateful_orders: BlockRateLimiter,
    short_term_cancellations: BlockRateLimiter,
}

impl ClobRateLimiters {
    pub fn new(config: &BlockRateLimitConfiguration) -> Self {
        if config.max_short_term_orders_per_n_blocks.is_empty()
            && config.max_stateful_orders_per_n_blocks.is_empty()
            && config.max_short_term_order_cancellations_per_n_blocks.is_empty()
        {
            warn!("No block rate limits configured");
        }
        Self {
            short_term_orders: BlockRateLimiter::new(
                "short_term_orders",
                config.max_short_term_orders_per_n_blocks.clone(),
            ),
            stateful_orders: BlockRateLimiter::new(
                "stateful_orders",
                config.max_stateful_orders_per_n_blocks.clone(),
            ),
            short_term_cancellations: BlockRateLimiter::new(
                "short_term_cancellations",
                config.max_short_term_order_cancellations_per_n_blocks.clone(),
            ),
        }
    }

    pub fn check_place(
        &self,
        mode: ExecMode,
        order: &Order,
        height: u32,
    ) -> Result<(), RejectReason> {
        let limiter = if order.is_stateful() {
            &self.stateful_orders
        } else {
            &self.short_term_orders
        };
        limiter.rate_limit(mode, order.subaccount_id(), height)
    }

    /// Only short-term cancellations are limited.
    pub fn check_cancel(
        &self,
        mode: ExecMode,
        order_id: &OrderId,
        height: u32,
    ) -> Result<(), RejectReason> {
        if order_id.is_stateful() {
            return Ok(());
        }
        self.short_term_cancellations
            .rate_limit(mode, &order_id.subaccount_id, height)
    }

    pub fn prune(&self, height: u32) {
        self.short_term_orders.prune(height);
        self.stateful_orders.prune(height);
        self.short_term_cancellations.prune(height);
    }
}
