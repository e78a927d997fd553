//! Block and execution-phase descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which phase the node is executing in.
///
/// Speculative validation pre-screens candidates against a snapshot of committed
/// state; committed execution is the single ordered pass whose results are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Speculative,
    Committed,
}

impl ExecMode {
    #[inline]
    pub fn is_speculative(&self) -> bool {
        matches!(self, Self::Speculative)
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speculative => write!(f, "speculative"),
            Self::Committed => write!(f, "committed"),
        }
    }
}

/// Height and timestamp of the block being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: u32,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub time: DateTime<Utc>,
}

impl BlockInfo {
    pub fn new(height: u32, time: DateTime<Utc>) -> Self {
        Self { height, time }
    }
}
