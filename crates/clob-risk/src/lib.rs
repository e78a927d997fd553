//! Admission limits for the CLOB.
//!
//! - `equity_tier`: caps open orders per subaccount by net collateral
//! - `rate_limit`: caps placements and cancellations per subaccount over block windows
//!
//! Both checks run before any state is written; a rejection leaves state untouched.

pub mod equity_tier;
pub mod error;
pub mod rate_limit;

pub use equity_tier::{EquityTier, EquityTierLimitConfiguration};
pub use error::{RiskError, RiskResult};
pub use rate_limit::{
    BlockRateLimitConfiguration, BlockRateLimiter, ClobRateLimiters, MaxPerNBlocksRateLimit,
    MAX_NUM_BLOCKS,
};
