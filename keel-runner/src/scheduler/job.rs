//! Job handle
//!
//! A job is a named, retried, logged unit of work with a deadline. The
//! handle is shared between the executor, its registry and callers that
//! want to tail the log or wait for completion.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::service::{BoundedLogBuffer, LogBufferService, LogSink};

/// Lifecycle outcome of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Still retrying
    Running,

    /// The work function returned success
    Succeeded,

    /// The deadline elapsed before success
    Cancelled,
}

impl JobOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobOutcome::Running)
    }
}

impl std::fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobOutcome::Running => write!(f, "Running"),
            JobOutcome::Succeeded => write!(f, "Succeeded"),
            JobOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

struct JobInner {
    id: Uuid,
    name: String,
    started_at: DateTime<Utc>,
    started: Instant,
    timeout: Duration,
    log: Arc<BoundedLogBuffer>,
    attempts: AtomicU32,
    failures: AtomicU32,
    outcome: watch::Sender<JobOutcome>,
}

/// Shared handle to a job
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl JobHandle {
    pub(crate) fn new(name: &str, timeout: Duration, log_capacity: usize) -> Self {
        let (outcome, _) = watch::channel(JobOutcome::Running);

        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                name: name.to_string(),
                started_at: Utc::now(),
                started: Instant::now(),
                timeout,
                log: Arc::new(BoundedLogBuffer::new(log_capacity)),
                attempts: AtomicU32::new(0),
                failures: AtomicU32::new(0),
                outcome,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Absolute deadline after which no further attempts start
    pub fn deadline(&self) -> Instant {
        self.inner.started + self.inner.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Number of attempts started so far
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Number of failed attempts so far
    pub fn failure_count(&self) -> u32 {
        self.inner.failures.load(Ordering::SeqCst)
    }

    pub fn outcome(&self) -> JobOutcome {
        *self.inner.outcome.borrow()
    }

    /// Buffered log lines, oldest first
    pub fn log_lines(&self) -> Vec<String> {
        self.inner.log.snapshot()
    }

    /// Buffered log joined with newlines
    pub fn get_log(&self) -> String {
        self.inner.log.snapshot().join("\n")
    }

    /// Blocks until the job reaches a terminal state
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.inner.outcome.subscribe();
        match rx.wait_for(JobOutcome::is_terminal).await {
            Ok(outcome) => *outcome,
            Err(_) => self.outcome(),
        }
    }

    pub(crate) fn sink(&self) -> LogSink {
        LogSink::new(self.inner.log.clone())
    }

    pub(crate) fn record_attempt(&self) -> u32 {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.inner.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Closes the log and publishes the terminal outcome
    pub(crate) fn finish(&self, outcome: JobOutcome) {
        self.inner.log.close();
        self.inner.outcome.send_replace(outcome);
    }

    pub(crate) fn same_job(&self, other: &JobHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("outcome", &self.outcome())
            .field("attempts", &self.attempts())
            .finish()
    }
}
