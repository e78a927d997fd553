//! Prometheus metrics and structured logging for the CLOB lifecycle engine.
//!
//! - Prometheus metrics for fills, stateful placements, expirations, triggers,
//!   TWAP releases and admission rejections
//! - Structured JSON logging with tracing

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
