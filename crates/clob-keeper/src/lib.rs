//! Stateful order lifecycle for the CLOB.
//!
//! Components, leaf first:
//! - `fills`: fill ledger with deferred height-keyed pruning
//! - `stateful`: durable placement records and per-subaccount counts
//! - `expiration`: time-bucketed expiration index
//! - `conditional`: oracle-driven trigger engine
//! - `twap`: TWAP decomposition and leg release
//! - `keeper`: `ClobKeeper`, the facade that owns the store and runs end-of-block
//!
//! Block-scoped counters live in `context`; collaborator traits in `expected`.

pub mod conditional;
pub mod context;
pub mod error;
pub mod expected;
pub mod expiration;
pub mod fills;
pub mod keeper;
pub mod keys;
pub mod stateful;
pub mod twap;

pub use conditional::{ConditionalEngine, UntriggeredOrders};
pub use context::{pending_stateful_count, BlockContext, UncommittedOrderCounts};
pub use error::{KeeperError, KeeperResult};
pub use expected::{
    CollateralSource, MatchOutcome, MatchedFill, MatchingEngine, OracleSource, OrderFilter,
    OrderbookInfo,
};
pub use expiration::ExpirationIndex;
pub use fills::{FillLedger, FillState};
pub use keeper::{
    AppliedFill, ClobKeeper, EndBlockOutcome, PlacementKind, RemovalReason, StatefulPlacement,
    DEFAULT_SHORT_BLOCK_WINDOW,
};
pub use stateful::{
    PlaceOutcome, StatefulOrderPlacement, StatefulOrderStore, TransactionOrdering,
};
pub use twap::{TwapEngine, TwapOrderPlacement, TwapPlan, TwapRelease};
