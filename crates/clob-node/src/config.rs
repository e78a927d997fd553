//! Node configuration.

use clob_keeper::DEFAULT_SHORT_BLOCK_WINDOW;
use clob_risk::{BlockRateLimitConfiguration, EquityTierLimitConfiguration};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{NodeError, NodeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Open-order caps by net collateral.
    #[serde(default)]
    pub equity_tiers: EquityTierLimitConfiguration,

    /// Per-subaccount request caps over recent blocks.
    #[serde(default)]
    pub rate_limits: BlockRateLimitConfiguration,

    /// Blocks a short-term or TWAP leg fill record is kept once the order can
    /// no longer match. Default: 20.
    #[serde(default = "default_short_block_window")]
    pub short_block_window: u32,

    /// Where the durable store is snapshotted after each block. No snapshot
    /// is read or written when unset.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_short_block_window() -> u32 {
    DEFAULT_SHORT_BLOCK_WINDOW
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            equity_tiers: EquityTierLimitConfiguration::default(),
            rate_limits: BlockRateLimitConfiguration::default(),
            short_block_window: default_short_block_window(),
            snapshot_path: None,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> NodeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| NodeError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> NodeResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| NodeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> NodeResult<()> {
        self.equity_tiers.validate()?;
        self.rate_limits.validate()?;
        if self.short_block_window == 0 {
            return Err(NodeError::Config(
                "short_block_window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
