use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all scanner metrics
const PREFIX: &str = "media_scanner";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Per-item outcomes
    pub static ref ITEMS_SCANNED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_items_scanned_total"), "Work items scanned, by final status"),
        &["status"]
    ).expect("Failed to create items_scanned_total metric");

    pub static ref ITEM_SCAN_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_item_scan_duration_seconds"),
            "Per-item scan duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("Failed to create item_scan_duration_seconds metric");

    // Downloads
    pub static ref DOWNLOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_downloads_total"), "Media downloads, by result"),
        &["result"]
    ).expect("Failed to create downloads_total metric");

    pub static ref DOWNLOADED_BYTES_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_downloaded_bytes_total"),
        "Total bytes streamed to local payloads"
    ).expect("Failed to create downloaded_bytes_total metric");

    // External services
    pub static ref SERVICE_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_service_calls_total"), "Similarity index and classifier calls"),
        &["service", "result"]
    ).expect("Failed to create service_calls_total metric");

    // Verdict cache
    pub static ref CACHE_LOOKUPS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_cache_lookups_total"), "Verdict cache lookups, by outcome"),
        &["outcome"]
    ).expect("Failed to create cache_lookups_total metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(ITEMS_SCANNED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ITEM_SCAN_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADED_BYTES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_CALLS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CACHE_LOOKUPS_TOTAL.clone()));

    tracing::debug!("Scanner metrics registered");
}

/// Record the final status of one work item
pub fn record_item_outcome(status: &str, duration: Duration) {
    ITEMS_SCANNED_TOTAL.with_label_values(&[status]).inc();
    ITEM_SCAN_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration.as_secs_f64());
}

/// Record a finished download attempt chain
pub fn record_download(result: &str, bytes: u64) {
    DOWNLOADS_TOTAL.with_label_values(&[result]).inc();
    if bytes > 0 {
        DOWNLOADED_BYTES_TOTAL.inc_by(bytes as f64);
    }
}

/// Record a call to an external collaborator
pub fn record_service_call(service: &str, result: &str) {
    SERVICE_CALLS_TOTAL
        .with_label_values(&[service, result])
        .inc();
}

/// Record a verdict cache lookup (`hit`, `pending`, `miss`)
pub fn record_cache_lookup(outcome: &str) {
    CACHE_LOOKUPS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Render the registry in the Prometheus text exposition format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
