//! Metrics and observability utilities
//!
//! Prometheus metrics for the extraction pipeline and the status gateway,
//! with standardized naming under a single prefix.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Intake metrics
pub const METRICS_PREFIX: &str = "intake";

/// Buckets for HTTP request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
];

/// Buckets for extraction attempts and provider calls, bounded by the hard limit
pub const TASK_BUCKETS: &[f64] = &[
    0.100,  // 100ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // provider timeout
    240.0,  // soft limit
    300.0,  // hard limit
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Task lifecycle
    describe_counter!(
        format!("{}_tasks_started_total", METRICS_PREFIX),
        Unit::Count,
        "Extraction attempts started"
    );

    describe_counter!(
        format!("{}_tasks_retried_total", METRICS_PREFIX),
        Unit::Count,
        "Extraction attempts re-enqueued"
    );

    describe_counter!(
        format!("{}_tasks_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Extraction attempts that reached a terminal state"
    );

    describe_histogram!(
        format!("{}_task_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Extraction attempt wall time in seconds"
    );

    describe_counter!(
        format!("{}_deliveries_skipped_total", METRICS_PREFIX),
        Unit::Count,
        "Deliveries skipped as duplicate, superseded or already complete"
    );

    // Provider
    describe_histogram!(
        format!("{}_provider_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Text recognition call latency in seconds"
    );

    describe_counter!(
        format!("{}_provider_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Text recognition call failures"
    );

    // Cache
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    // Sweeps and notifications
    describe_counter!(
        format!("{}_sweep_actions_total", METRICS_PREFIX),
        Unit::Count,
        "Rows touched by reconciliation sweeps"
    );

    describe_counter!(
        format!("{}_notifications_dropped_total", METRICS_PREFIX),
        Unit::Count,
        "Progress notifications that failed to publish"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

pub fn record_task_started(trigger: &str) {
    counter!(
        format!("{}_tasks_started_total", METRICS_PREFIX),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub fn record_task_retried(trigger: &str) {
    counter!(
        format!("{}_tasks_retried_total", METRICS_PREFIX),
        "trigger" => trigger.to_string()
    )
    .increment(1);
}

pub fn record_task_finished(status: &str, duration_secs: f64) {
    counter!(
        format!("{}_tasks_finished_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_task_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

pub fn record_delivery_skipped(reason: &str) {
    counter!(
        format!("{}_deliveries_skipped_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Helper to record provider call metrics
pub fn record_provider_call(duration_secs: f64, provider: &str, success: bool) {
    histogram!(
        format!("{}_provider_duration_seconds", METRICS_PREFIX),
        "provider" => provider.to_string()
    )
    .record(duration_secs);

    if !success {
        counter!(
            format!("{}_provider_errors_total", METRICS_PREFIX),
            "provider" => provider.to_string()
        )
        .increment(1);
    }
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, category: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "category" => category.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "category" => category.to_string()
        )
        .increment(1);
    }
}

/// `action` is one of rescued, failed, orphaned, purged
pub fn record_sweep(action: &str, count: u64) {
    counter!(
        format!("{}_sweep_actions_total", METRICS_PREFIX),
        "action" => action.to_string()
    )
    .increment(count);
}

pub fn record_notification_dropped() {
    counter!(format!("{}_notifications_dropped_total", METRICS_PREFIX)).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, TASK_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
        assert_eq!(TASK_BUCKETS.last(), Some(&300.0));
    }

    #[test]
    fn test_recorders_without_exporter() {
        let metrics = RequestMetrics::start("GET", "/v1/documents/{id}/status");
        metrics.finish(200);
        record_task_started("upload");
        record_sweep("purged", 0);
        record_notification_dropped();
    }
}
