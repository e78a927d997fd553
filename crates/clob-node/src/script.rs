//! JSON block scripts for replay.
//!
//! ```json
//! {
//!   "markets": [{ "id": 0, "subticks_per_tick": 1, "step_base_quantums": 1, "oracle_price": "50" }],
//!   "collateral": [{ "subaccount": { "owner": "alice", "number": 0 }, "amount": 10000 }],
//!   "blocks": [
//!     { "height": 1, "time": 10, "prices": [{ "market": 0, "price": "49.5" }], "txs": [{ "place": { ... } }] }
//!   ]
//! }
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use clob_core::{BlockInfo, ClobPairId, SubaccountId};
use clob_keeper::{MatchingEngine, OrderbookInfo};

use crate::app::{BlockReport, Node, Tx};
use crate::error::{NodeError, NodeResult};
use crate::sim::{SimBook, SimCollateral, SimOracle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSetup {
    pub id: ClobPairId,
    pub subticks_per_tick: u64,
    pub step_base_quantums: u64,
    #[serde(default)]
    pub oracle_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralSetup {
    pub subaccount: SubaccountId,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub market: ClobPairId,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptBlock {
    pub height: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
    /// Oracle updates applied before the block runs.
    #[serde(default)]
    pub prices: Vec<PriceUpdate>,
    #[serde(default)]
    pub collateral: Vec<CollateralSetup>,
    #[serde(default)]
    pub txs: Vec<Tx>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockScript {
    #[serde(default)]
    pub markets: Vec<MarketSetup>,
    #[serde(default)]
    pub collateral: Vec<CollateralSetup>,
    pub blocks: Vec<ScriptBlock>,
}

impl BlockScript {
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> NodeResult<Self> {
        let script: Self = serde_json::from_str(content)
            .map_err(|e| NodeError::Script(format!("Failed to parse block script: {e}")))?;
        for pair in script.blocks.windows(2) {
            if pair[1].height <= pair[0].height {
                return Err(NodeError::Script(format!(
                    "block heights must increase: {} then {}",
                    pair[0].height, pair[1].height
                )));
            }
        }
        Ok(script)
    }

    /// Reference collaborators seeded from the script header.
    pub fn build_sim(&self) -> (SimBook, SimOracle, SimCollateral) {
        let mut book = SimBook::new();
        let mut oracle = SimOracle::new();
        for market in &self.markets {
            book.add_market(
                market.id,
                OrderbookInfo {
                    subticks_per_tick: market.subticks_per_tick,
                    step_base_quantums: market.step_base_quantums,
                },
            );
            if let Some(price) = market.oracle_price {
                oracle.set_price(market.id, price);
            }
        }
        let mut collateral = SimCollateral::new();
        for entry in &self.collateral {
            collateral.set(entry.subaccount.clone(), i128::from(entry.amount));
        }
        (book, oracle, collateral)
    }
}

/// Run every block above the node's committed height.
pub fn replay<M: MatchingEngine>(
    node: &mut Node<M>,
    blocks: &[ScriptBlock],
    oracle: &mut SimOracle,
    collateral: &mut SimCollateral,
) -> NodeResult<Vec<BlockReport>> {
    let mut reports = Vec::with_capacity(blocks.len());
    for block in blocks {
        for update in &block.prices {
            oracle.set_price(update.market, update.price);
        }
        for entry in &block.collateral {
            collateral.set(entry.subaccount.clone(), i128::from(entry.amount));
        }
        if block.height <= node.last_height() {
            info!(
                height = block.height,
                committed = node.last_height(),
                "Skipping already committed block"
            );
            continue;
        }
        let info = BlockInfo::new(block.height, block.time);
        reports.push(node.process_block(info, &block.txs, &*oracle, &*collateral)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use clob_core::{BaseQuantums, OrderId};

    const SCRIPT: &str = r#"{
        "markets": [{ "id": 0, "subticks_per_tick": 1, "step_base_quantums": 1, "oracle_price": "50" }],
        "collateral": [{ "subaccount": { "owner": "alice", "number": 0 }, "amount": 10000 }],
        "blocks": [
            {
                "height": 1,
                "time": 100,
                "txs": [{ "place": {
                    "order_id": {
                        "subaccount_id": { "owner": "alice", "number": 0 },
                        "clob_pair_id": 0,
                        "flavor": "twap_parent",
                        "client_id": 7,
                        "sequence": 0
                    },
                    "side": "buy",
                    "quantums": 100,
                    "subticks": 50,
                    "time_in_force": "Gtc",
                    "good_til": { "time": 10000 },
                    "reduce_only": false,
                    "conditional": null,
                    "twap": { "duration_secs": 300, "interval_secs": 60, "price_tolerance_ppm": 0 }
                } }]
            },
            { "height": 2, "time": 160, "prices": [{ "market": 0, "price": "51" }] },
            { "height": 3, "time": 220 }
        ]
    }"#;

    #[test]
    fn test_twap_script_releases_one_leg_per_interval() {
        let script = BlockScript::from_json(SCRIPT).unwrap();
        let (book, mut oracle, mut collateral) = script.build_sim();
        let mut node = Node::new(NodeConfig::default(), book).unwrap();
        let reports = replay(&mut node, &script.blocks, &mut oracle, &mut collateral).unwrap();

        let released: Vec<usize> = reports.iter().map(|r| r.released_legs.len()).collect();
        assert_eq!(released, vec![1, 1, 1]);

        let parent = OrderId::new(
            SubaccountId::new("alice", 0),
            7,
            ClobPairId(0),
            clob_core::OrderFlavor::TwapParent,
        );
        let progress = node.keeper().twap_placement(&parent).unwrap().unwrap();
        // nothing to trade against, so every leg expired unfilled
        assert_eq!(progress.remaining_quantums, BaseQuantums(100));
        assert_eq!(progress.remaining_legs, 2);
    }

    #[test]
    fn test_heights_must_increase() {
        let err = BlockScript::from_json(
            r#"{ "blocks": [{ "height": 2, "time": 1 }, { "height": 2, "time": 2 }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, NodeError::Script(_)));
    }
}
