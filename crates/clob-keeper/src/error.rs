//! Keeper error types.

use clob_core::{CoreError, InvariantViolation, RejectReason};
use clob_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("Rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

impl KeeperError {
    /// Whether the enclosing block must be aborted.
    ///
    /// Only admission rejections are recoverable; a store that cannot be
    /// decoded is as broken as a violated invariant.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Core(_))
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;
