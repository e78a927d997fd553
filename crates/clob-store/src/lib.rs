//! Ordered key-value state for the CLOB lifecycle engine.
//!
//! - [`KvStore`]: the ordered byte store every keyspace lives in
//! - [`MemStore`]: `BTreeMap`-backed implementation
//! - [`codec`]: stable value encoding (MessagePack) and ordered key helpers
//! - [`snapshot`]: write/read the durable store to disk for restart

pub mod codec;
pub mod error;
pub mod kv;
pub mod snapshot;

pub use error::{StoreError, StoreResult};
pub use kv::{prefix_end, KvStore, MemStore};
pub use snapshot::{load_snapshot, save_snapshot, Snapshot};
