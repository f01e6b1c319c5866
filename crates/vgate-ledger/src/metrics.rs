//! Ledger metrics.

use metrics::{counter, histogram};

/// Metric name constants.
pub mod names {
    /// Ledger operations by operation and outcome.
    pub const OPERATIONS_TOTAL: &str = "vgate_ledger_operations_total";

    /// Ledger operation latency in seconds.
    pub const LATENCY_SECONDS: &str = "vgate_ledger_latency_seconds";

    /// Transitions rejected by compare-and-swap.
    pub const CONFLICTS_TOTAL: &str = "vgate_ledger_conflicts_total";
}

/// Record a completed ledger operation.
pub fn record_operation(operation: &'static str, ok: bool, latency_secs: f64) {
    counter!(
        names::OPERATIONS_TOTAL,
        "operation" => operation,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(names::LATENCY_SECONDS, "operation" => operation).record(latency_secs);
}

/// Record a lost compare-and-swap.
pub fn record_conflict() {
    counter!(names::CONFLICTS_TOTAL).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::OPERATIONS_TOTAL.starts_with("vgate_ledger_"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
        assert!(names::CONFLICTS_TOTAL.contains("conflicts"));
    }
}
