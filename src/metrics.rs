use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

/// Process-wide Prometheus registry. Counters are cheap to bump from any
/// service; `/metrics` renders the lot.
pub struct Metrics {
    pub registry: Registry,
    pub scanner_files_discovered: IntCounter,
    pub scanner_files_queued: IntCounter,
    pub processor_files_processed: IntCounter,
    pub processor_files_duplicate: IntCounter,
    pub processor_files_failed: IntCounter,
    pub processor_active_workers: IntGauge,
    pub geocoder_requests: IntCounter,
    pub geocoder_errors: IntCounter,
    pub places_created: IntCounter,
    pub trash_purged: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static counter name");
    registry.register(Box::new(c.clone())).expect("unique metric name");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("static gauge name");
    registry.register(Box::new(g.clone())).expect("unique metric name");
    g
}

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let registry = Registry::new();
        Metrics {
            scanner_files_discovered: counter(
                &registry,
                "lumapix_scanner_files_discovered_total",
                "Files first seen in the uploads tree",
            ),
            scanner_files_queued: counter(
                &registry,
                "lumapix_scanner_files_queued_total",
                "Stable files handed to the task queue",
            ),
            processor_files_processed: counter(
                &registry,
                "lumapix_processor_files_processed_total",
                "Files ingested to ready",
            ),
            processor_files_duplicate: counter(
                &registry,
                "lumapix_processor_files_duplicate_total",
                "Files dropped as byte-identical duplicates",
            ),
            processor_files_failed: counter(
                &registry,
                "lumapix_processor_files_failed_total",
                "Files quarantined after final failure",
            ),
            processor_active_workers: gauge(
                &registry,
                "lumapix_processor_active_workers",
                "Workers currently inside a task handler",
            ),
            geocoder_requests: counter(
                &registry,
                "lumapix_geocoder_requests_total",
                "Reverse geocoding requests issued",
            ),
            geocoder_errors: counter(
                &registry,
                "lumapix_geocoder_errors_total",
                "Reverse geocoding requests that failed",
            ),
            places_created: counter(
                &registry,
                "lumapix_places_created_total",
                "Places created from geocoder responses",
            ),
            trash_purged: counter(
                &registry,
                "lumapix_trash_purged_total",
                "Photos permanently removed by the trash purge",
            ),
            registry,
        }
    })
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&metrics().registry.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_contains_counters() {
        metrics().processor_files_processed.inc();
        let text = render();
        assert!(text.contains("lumapix_processor_files_processed_total"));
        assert!(text.contains("lumapix_geocoder_requests_total"));
    }
}
