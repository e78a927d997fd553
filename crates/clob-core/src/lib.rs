//! Core order types for the CLOB order-lifecycle engine.
//!
//! This crate provides the types shared by every lifecycle component:
//! - `OrderId`, `SubaccountId`, `ClobPairId`: order identity and its ordered byte key
//! - `Order`: the full order with conditional / TWAP parameters
//! - `Subticks`, `BaseQuantums`: fixed-point price and size units
//! - `BlockInfo`, `ExecMode`: the current block and execution phase
//! - `RejectReason`, `InvariantViolation`: the two error classes shared across crates

pub mod admission;
pub mod block;
pub mod error;
pub mod ids;
pub mod order;
pub mod quantums;

pub use admission::{InvariantViolation, RejectReason};
pub use block::{BlockInfo, ExecMode};
pub use error::{CoreError, Result};
pub use ids::{ClobPairId, OrderFlavor, OrderId, SubaccountId};
pub use order::{
    ConditionKind, ConditionalParams, GoodTil, Order, Side, TimeInForce, TriggerDirection,
    TwapParams,
};
pub use quantums::{BaseQuantums, Subticks, PPM};
