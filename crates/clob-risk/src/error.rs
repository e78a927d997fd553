//! Risk error types.

use clob_core::{InvariantViolation, RejectReason};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RiskError {
    /// Whether the enclosing block must be aborted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

pub type RiskResult<T> = Result<T, RiskError>;
