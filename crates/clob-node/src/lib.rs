//! Block replay node for the CLOB order lifecycle.
//!
//! Wires the lifecycle keeper, admission limits and a matching engine into a
//! two-phase block pipeline:
//! - `app`: speculative screening and committed block execution
//! - `config`: TOML node configuration
//! - `script`: JSON block scripts and replay
//! - `sim`: in-process reference matching engine, oracle and collateral

pub mod app;
pub mod config;
pub mod error;
pub mod script;
pub mod sim;

pub use app::{BlockReport, FillReport, Node, Rejection, Tx};
pub use config::NodeConfig;
pub use error::{NodeError, NodeResult};
pub use script::{replay, BlockScript};
