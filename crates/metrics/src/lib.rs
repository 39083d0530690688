//! Metrics facade for netwatch.
//!
//! Re-exports the `metrics` macros so instrumented crates depend on a single
//! place, and defines every metric name in [`definitions`]. Without an
//! installed recorder all macros are no-ops.

pub use metrics::{counter, gauge, histogram};

/// Metric names and label keys.
pub mod definitions {
    /// Filter decisions, labelled by `result` (`allowed`/`blocked`/`bypassed`)
    /// and, for blocks, `reason`.
    pub const FILTER_DECISIONS_TOTAL: &str = "netwatch_filter_decisions_total";
    /// Time spent evaluating a request against the rule snapshot.
    pub const FILTER_DECISION_DURATION_SECONDS: &str = "netwatch_filter_decision_duration_seconds";
    /// Number of rules currently loaded, labelled by `kind`.
    pub const FILTER_RULES: &str = "netwatch_filter_rules";
    /// Rule-file writes that failed after an in-memory swap.
    pub const FILTER_RULE_PERSIST_FAILURES_TOTAL: &str =
        "netwatch_filter_rule_persist_failures_total";
    /// Events appended to the event store, labelled by `table`.
    pub const EVENTS_RECORDED_TOTAL: &str = "netwatch_events_recorded_total";
    /// Event-store appends that failed and were dropped, labelled by `table`.
    pub const EVENT_STORE_FAILURES_TOTAL: &str = "netwatch_event_store_failures_total";

    pub mod labels {
        pub const RESULT: &str = "result";
        pub const REASON: &str = "reason";
        pub const KIND: &str = "kind";
        pub const TABLE: &str = "table";
    }
}

/// Install a global Prometheus recorder serving `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, metrics_exporter_prometheus::PrometheusBuilder};

    #[test]
    fn counters_render_under_defined_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!(
                definitions::FILTER_DECISIONS_TOTAL,
                definitions::labels::RESULT => "blocked"
            )
            .increment(2);
            gauge!(definitions::FILTER_RULES, definitions::labels::KIND => "domains").set(3.0);
        });

        let rendered = handle.render();
        assert!(rendered.contains("netwatch_filter_decisions_total{result=\"blocked\"} 2"));
        assert!(rendered.contains("netwatch_filter_rules{kind=\"domains\"} 3"));
    }

    #[test]
    fn macros_are_noops_without_recorder() {
        counter!(definitions::EVENT_STORE_FAILURES_TOTAL).increment(1);
        histogram!(definitions::FILTER_DECISION_DURATION_SECONDS).record(0.001);
    }
}
