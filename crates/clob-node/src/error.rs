//! Node error types.

use clob_core::RejectReason;
use clob_keeper::KeeperError;
use clob_risk::RiskError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("Keeper error: {0}")]
    Keeper(#[from] KeeperError),

    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),

    #[error("Store error: {0}")]
    Store(#[from] clob_store::StoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] clob_telemetry::TelemetryError),

    #[error("Block script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether the node must stop rather than drop the offending request.
    pub fn is_fatal(&self) -> bool {
        self.reject_reason().is_none()
    }

    /// The admission rejection carried by this error, at any layer.
    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected(reason)
            | Self::Keeper(KeeperError::Rejected(reason))
            | Self::Risk(RiskError::Rejected(reason)) => Some(reason),
            _ => None,
        }
    }
}

pub type NodeResult<T> = Result<T, NodeError>;
