//! Metrics sink
//!
//! Fire-and-forget counters and timings. Implementations must never block
//! or fail the operation being measured.

use std::time::Duration;

/// Receiver for job and reconciliation metrics
pub trait MetricsSink: Send + Sync {
    /// A job reached a terminal state
    fn job_finished(&self, job: &str, succeeded: bool, elapsed: Duration);

    /// A single job attempt failed and will be retried
    fn job_attempt_failed(&self, job: &str);

    /// A reconciliation pass completed
    fn reconcile_pass(&self, key: &str, succeeded: bool);
}

/// Metrics sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn job_finished(&self, _job: &str, _succeeded: bool, _elapsed: Duration) {}

    fn job_attempt_failed(&self, _job: &str) {}

    fn reconcile_pass(&self, _key: &str, _succeeded: bool) {}
}
