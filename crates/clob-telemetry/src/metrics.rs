//! Prometheus metrics for the CLOB lifecycle engine.
//!
//! Covers:
//! - Fill ledger pruning and retention drift
//! - Stateful order placement / removal / expiry
//! - Conditional triggers and untriggered backlog
//! - TWAP leg releases
//! - Admission rejections (equity tier, block rate limit)
//! - End-of-block latency
//!
//! # Panics
//!
//! Metric registration uses `unwrap()` intentionally. If registration fails,
//! it indicates a fatal configuration error (e.g., duplicate metric names)
//! that should cause an immediate crash at startup rather than silent failure.
//! These panics only occur during static initialization, never at runtime.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_int_counter,
    CounterVec, Encoder, GaugeVec, Histogram, IntCounter, TextEncoder,
};

use crate::error::TelemetryResult;

/// Fill records removed by the prune sweep.
pub static FILLS_PRUNED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "clob_fills_pruned_total",
        "Fill records removed by the block-height prune sweep"
    )
    .unwrap()
});

/// Fill records skipped by the prune sweep because a later write extended retention.
pub static PRUNE_RETENTION_EXTENDED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "clob_prune_retention_extended_total",
        "Fill records skipped during pruning because prunable_after moved past the swept height"
    )
    .unwrap()
});

/// Stateful order placements.
/// Labels: flavor, outcome (created/replaced/triggered)
pub static STATEFUL_ORDERS_PLACED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_stateful_orders_placed_total",
        "Stateful order placement records written",
        &["flavor", "outcome"]
    )
    .unwrap()
});

/// Stateful order removals.
/// Labels: flavor, reason (cancelled/expired/filled)
pub static STATEFUL_ORDERS_REMOVED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_stateful_orders_removed_total",
        "Stateful orders forgotten by the lifecycle engine",
        &["flavor", "reason"]
    )
    .unwrap()
});

/// Conditional orders triggered.
/// Labels: market, direction (lte/gte)
pub static CONDITIONAL_TRIGGERED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_conditional_triggered_total",
        "Conditional orders triggered by oracle price",
        &["market", "direction"]
    )
    .unwrap()
});

/// Untriggered conditional orders per market.
pub static UNTRIGGERED_ORDERS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "clob_untriggered_orders",
        "Untriggered conditional orders waiting on the oracle",
        &["market"]
    )
    .unwrap()
});

/// TWAP legs released for placement.
pub static TWAP_LEGS_RELEASED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "clob_twap_legs_released_total",
        "TWAP legs released at their trigger instant"
    )
    .unwrap()
});

/// Admission rejections.
/// Labels: reason, phase (speculative/committed)
pub static ADMISSION_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "clob_admission_rejected_total",
        "Order or cancel requests rejected before reaching the matching engine",
        &["reason", "phase"]
    )
    .unwrap()
});

/// End-of-block processing time in milliseconds.
pub static END_BLOCK_DURATION_MS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "clob_end_block_duration_ms",
        "End-of-block lifecycle processing time in milliseconds",
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 500.0]
    )
    .unwrap()
});

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    pub fn fills_pruned(count: usize) {
        FILLS_PRUNED_TOTAL.inc_by(count as u64);
    }

    pub fn prune_retention_extended() {
        PRUNE_RETENTION_EXTENDED_TOTAL.inc();
    }

    /// Record a stateful placement write.
    pub fn stateful_order_placed(flavor: &str, outcome: &str) {
        STATEFUL_ORDERS_PLACED_TOTAL
            .with_label_values(&[flavor, outcome])
            .inc();
    }

    /// Record a stateful order being forgotten.
    pub fn stateful_order_removed(flavor: &str, reason: &str) {
        STATEFUL_ORDERS_REMOVED_TOTAL
            .with_label_values(&[flavor, reason])
            .inc();
    }

    pub fn conditional_triggered(market: &str, direction: &str, count: usize) {
        CONDITIONAL_TRIGGERED_TOTAL
            .with_label_values(&[market, direction])
            .inc_by(count as f64);
    }

    pub fn untriggered_orders(market: &str, count: usize) {
        UNTRIGGERED_ORDERS
            .with_label_values(&[market])
            .set(count as f64);
    }

    pub fn twap_legs_released(count: usize) {
        TWAP_LEGS_RELEASED_TOTAL.inc_by(count as u64);
    }

    pub fn admission_rejected(reason: &str, phase: &str) {
        ADMISSION_REJECTED_TOTAL
            .with_label_values(&[reason, phase])
            .inc();
    }

    pub fn end_block_duration(duration_ms: f64) {
        END_BLOCK_DURATION_MS.observe(duration_ms);
    }

    /// Render the default registry in Prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let before = FILLS_PRUNED_TOTAL.get();
        Metrics::fills_pruned(3);
        assert!(FILLS_PRUNED_TOTAL.get() >= before + 3);
    }

    #[test]
    fn test_render_contains_registered_metric() {
        Metrics::admission_rejected("equity_tier", "speculative");
        let text = Metrics::render().unwrap();
        assert!(text.contains("clob_admission_rejected_total"));
    }
}
