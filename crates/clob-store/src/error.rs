//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
