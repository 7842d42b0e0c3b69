use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize the Prometheus metrics exporter.
/// Returns a handle that can be used to render metrics for scraping.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Register every metric at zero so they all appear in the exposition
/// before the first event occurs. Must run after `init_metrics`.
pub fn initialize_metrics() {
    metrics::counter!("ingest.ticks").absolute(0);
    metrics::counter!("ingest.rate_limited").absolute(0);
    metrics::counter!("ingest.errors").absolute(0);
    metrics::counter!("store.points_upserted").absolute(0);
    metrics::counter!("store.rows_skipped").absolute(0);
    metrics::counter!("ws.diffs_sent").absolute(0);
    metrics::counter!("ws.acks").absolute(0);
    metrics::gauge!("ws.connections").set(0.0);
    metrics::gauge!("store.keys").set(0.0);
}
