//! Prometheus metrics for build bot observability.

use metrics::{counter, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record the end of an ingest (`published`, `dry_run` or `failed`).
pub fn ingest_finished(outcome: &str) {
    counter!("bot_ingests_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record an artifact written to the object store.
pub fn artifact_stored() {
    counter!("bot_artifacts_stored_total").increment(1);
}

/// Record an artifact served to a client.
pub fn artifact_downloaded() {
    counter!("bot_artifact_downloads_total").increment(1);
}

/// Record a publish that stopped at `stage`.
pub fn publish_failed(stage: &str) {
    counter!("bot_publish_failures_total", "stage" => stage.to_string()).increment(1);
}

/// Record the duration of a successful publish.
pub fn publish_duration(duration_ms: u64) {
    histogram!("bot_publish_duration_ms").record(duration_ms as f64);
}
