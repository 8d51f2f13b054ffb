//! Prometheus metrics exposition
//!
//! Service metrics:
//!
//! - `quota_proxy_requests_total` (counter): labels `status`, `method`
//! - `quota_proxy_request_duration_seconds` (histogram): label `status`
//! - `quota_proxy_upstream_errors_total` (counter): label `error_type`
//! - `quota_proxy_rejected_total` (counter): label `reason`
//!
//! The scheduler crate records its own `access_pool_*` series through the
//! same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Scheduler waits range from instant admission up to `max_wait_secs`.
const WAIT_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0,
];

/// Builder with histogram buckets for every histogram the service records.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("quota_proxy_request_duration_seconds".to_string()),
            REQUEST_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full("access_pool_wait_seconds".to_string()),
            WAIT_BUCKETS,
        )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Must be called once, before the scheduler starts recording.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed proxy request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("quota_proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("quota_proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("quota_proxy_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a request refused by the scheduler (`quota_exhausted`, `rate_limited`).
pub fn record_rejection(reason: &'static str) {
    metrics::counter!("quota_proxy_rejected_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_upstream_error("timeout");
        record_rejection("quota_exhausted");
    }

    /// `build_recorder()` avoids the process-wide recorder singleton.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(503, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("quota_proxy_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("status=\"503\""));
        assert!(output.contains("method=\"POST\""));
        assert!(
            output.contains("quota_proxy_request_duration_seconds_bucket"),
            "histogram must render _bucket lines, got: {output}"
        );
    }

    #[test]
    fn record_upstream_error_and_rejection_carry_labels() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("timeout");
        record_rejection("rate_limited");

        let output = handle.render();
        assert!(
            output.contains("quota_proxy_upstream_errors_total{error_type=\"timeout\"} 2"),
            "got: {output}"
        );
        assert!(
            output.contains("quota_proxy_rejected_total{reason=\"rate_limited\"} 1"),
            "got: {output}"
        );
    }

    #[test]
    fn scheduler_wait_histogram_uses_wait_buckets() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        metrics::histogram!("access_pool_wait_seconds").record(42.0);

        let output = handle.render();
        assert!(output.contains("access_pool_wait_seconds_bucket"), "got: {output}");
        assert!(output.contains("le=\"300\""), "got: {output}");
    }

    #[test]
    fn request_histogram_bucket_boundaries() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.003);

        let output = handle.render();
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
        assert!(output.contains("le=\"+Inf\""));
    }
}
