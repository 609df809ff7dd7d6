//! Metrics emitted as tracing events

use keel_core::metrics::MetricsSink;
use std::time::Duration;
use tracing::debug;

/// Metrics sink that records each measurement as a debug-level event
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn job_finished(&self, job: &str, succeeded: bool, elapsed: Duration) {
        debug!(
            metric = "job_finished",
            job,
            succeeded,
            elapsed_ms = elapsed.as_millis() as u64
        );
    }

    fn job_attempt_failed(&self, job: &str) {
        debug!(metric = "job_attempt_failed", job);
    }

    fn reconcile_pass(&self, key: &str, succeeded: bool) {
        debug!(metric = "reconcile_pass", key, succeeded);
    }
}
