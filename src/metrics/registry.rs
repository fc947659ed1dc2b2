use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register descriptions.
    /// Must be called once at startup, before any macro call.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client perspective"
        );
        describe_counter!(
            "gateway_transport_fallback_total",
            Unit::Count,
            "Raw-socket failures that fell back to the high-level transport"
        );
        describe_counter!(
            "gateway_gemini_interruptions_total",
            Unit::Count,
            "Gemini SSE streams that ended without a usable finish reason"
        );
        describe_counter!(
            "gateway_gemini_retries_total",
            Unit::Count,
            "Continuation requests dispatched by the Gemini engine"
        );
        describe_gauge!(
            "gateway_ws_sessions_active",
            Unit::Count,
            "WebSocket relay sessions currently running"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Accepted and failed downstream connections"
        );
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Downstream connections currently open"
        );

        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}
