//! Job executor
//!
//! Owns the registry of named jobs. Each job runs in its own task: the
//! work function is retried with backoff until it succeeds or the job's
//! deadline elapses. A separate watcher fires the timeout callback at the
//! deadline; an attempt already in progress is left to finish on its own
//! and its result is discarded.

use keel_core::metrics::{MetricsSink, NoopMetrics};
use keel_core::{ControlError, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::scheduler::job::{JobHandle, JobOutcome};
use crate::service::LogSink;

#[derive(Default)]
struct Registry {
    active: HashMap<String, JobHandle>,
    last_failed: HashMap<String, JobHandle>,
}

struct ExecutorInner {
    label: String,
    config: ExecutorConfig,
    registry: Mutex<Registry>,
    gate: Arc<RwLock<()>>,
    metrics: Arc<dyn MetricsSink>,
}

/// Registry of named jobs with at most one active job per name
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

/// Guard returned by [`JobExecutor::lock`]
///
/// While held, `create_job` calls wait. Running jobs are unaffected and
/// still leave the registry when they finish.
pub struct ExecutorLock {
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExecutorLock {
    /// Releases the lock
    pub fn unlock(self) {}
}

impl JobExecutor {
    /// Creates a new executor
    ///
    /// # Arguments
    /// * `label` - Name used in logs (e.g. "cluster")
    /// * `config` - Backoff and log settings
    /// * `metrics` - Sink for job counters and latency
    pub fn new(label: &str, config: ExecutorConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                label: label.to_string(),
                config,
                registry: Mutex::new(Registry::default()),
                gate: Arc::new(RwLock::new(())),
                metrics,
            }),
        }
    }

    /// Creates an executor that discards metrics
    pub fn with_config(label: &str, config: ExecutorConfig) -> Self {
        Self::new(label, config, Arc::new(NoopMetrics))
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Registers and starts a job
    ///
    /// Returns as soon as the job is registered. Fails with `AlreadyRunning`
    /// if `name` already has an active job; the request is never queued.
    ///
    /// # Arguments
    /// * `timeout` - Time after which no further attempts start
    /// * `name` - Unique job name
    /// * `work` - Called once per attempt with the job's log sink
    /// * `on_timeout` - Called exactly once if the deadline elapses first
    pub async fn create_job<W, WF, T, TF>(
        &self,
        timeout: Duration,
        name: &str,
        work: W,
        on_timeout: T,
    ) -> Result<JobHandle>
    where
        W: FnMut(LogSink) -> WF + Send + 'static,
        WF: Future<Output = anyhow::Result<()>> + Send + 'static,
        T: FnOnce() -> TF + Send + 'static,
        TF: Future<Output = ()> + Send + 'static,
    {
        let _gate = self.inner.gate.read().await;

        let job = {
            let mut registry = self.inner.registry.lock().unwrap();
            if registry.active.contains_key(name) {
                return Err(ControlError::AlreadyRunning(name.to_string()));
            }

            let job = JobHandle::new(name, timeout, self.inner.config.log_capacity);
            registry.active.insert(name.to_string(), job.clone());
            job
        };

        info!(
            "[{}] Job {} ({}) submitted with timeout {:?}",
            self.inner.label,
            name,
            job.id(),
            timeout
        );

        tokio::spawn(supervise(
            Arc::clone(&self.inner),
            job.clone(),
            work,
            on_timeout,
        ));

        Ok(job)
    }

    /// Returns the active job for `name`, if any
    pub fn get_job(&self, name: &str) -> Option<JobHandle> {
        self.inner.registry.lock().unwrap().active.get(name).cloned()
    }

    /// Returns the most recent job for `name` that ended without success
    pub fn get_last_failed_job(&self, name: &str) -> Option<JobHandle> {
        self.inner
            .registry
            .lock()
            .unwrap()
            .last_failed
            .get(name)
            .cloned()
    }

    /// Number of active jobs
    pub fn count_jobs(&self) -> usize {
        self.inner.registry.lock().unwrap().active.len()
    }

    /// Names of active jobs
    pub fn active_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registry
            .lock()
            .unwrap()
            .active
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Blocks new job submissions until the returned guard is dropped
    pub async fn lock(&self) -> ExecutorLock {
        let guard = Arc::clone(&self.inner.gate).write_owned().await;
        debug!("[{}] Executor locked", self.inner.label);
        ExecutorLock { _guard: guard }
    }
}

/// Runs the retry loop against the job deadline and records the outcome
async fn supervise<W, WF, T, TF>(inner: Arc<ExecutorInner>, job: JobHandle, work: W, on_timeout: T)
where
    W: FnMut(LogSink) -> WF + Send + 'static,
    WF: Future<Output = anyhow::Result<()>> + Send + 'static,
    T: FnOnce() -> TF + Send + 'static,
    TF: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let mut attempts = tokio::spawn(retry_loop(
        inner.config.clone(),
        Arc::clone(&inner.metrics),
        job.clone(),
        work,
        cancel.clone(),
    ));

    let finished = tokio::select! {
        biased;
        result = &mut attempts => Some(result),
        _ = tokio::time::sleep_until(job.deadline()) => None,
    };

    let outcome = match finished {
        Some(Ok(outcome)) => outcome,
        Some(Err(e)) => {
            error!("[{}] Job {} task failed: {}", inner.label, job.name(), e);
            job.sink().line(format!("job aborted: {}", e));
            on_timeout().await;
            JobOutcome::Cancelled
        }
        None => {
            cancel.cancel();
            warn!(
                "[{}] Job {} exceeded its deadline of {:?} after {} attempt(s)",
                inner.label,
                job.name(),
                job.timeout(),
                job.attempts()
            );
            job.sink()
                .line(format!("job deadline of {:?} exceeded", job.timeout()));
            inner
                .registry
                .lock()
                .unwrap()
                .last_failed
                .insert(job.name().to_string(), job.clone());

            on_timeout().await;

            // The attempt in progress is not interrupted; the name stays
            // taken until it returns and its result is discarded
            match attempts.await {
                Ok(JobOutcome::Succeeded) => {
                    debug!("Job {} attempt finished after the deadline", job.name());
                }
                Ok(_) => {}
                Err(e) => error!("[{}] Job {} task failed: {}", inner.label, job.name(), e),
            }
            JobOutcome::Cancelled
        }
    };

    complete(&inner, &job, outcome);
}

/// Attempts the work function until success or cancellation
async fn retry_loop<W, WF>(
    config: ExecutorConfig,
    metrics: Arc<dyn MetricsSink>,
    job: JobHandle,
    mut work: W,
    cancel: CancellationToken,
) -> JobOutcome
where
    W: FnMut(LogSink) -> WF + Send + 'static,
    WF: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let sink = job.sink();

    loop {
        let delay = config.backoff(job.failure_count());
        if !delay.is_zero() {
            debug!("Job {} backing off for {:?}", job.name(), delay);
            tokio::select! {
                _ = cancel.cancelled() => return JobOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        let attempt = job.record_attempt();
        debug!("Job {} attempt {} started", job.name(), attempt);

        match work(sink.clone()).await {
            Ok(()) => {
                info!("Job {} succeeded on attempt {}", job.name(), attempt);
                return JobOutcome::Succeeded;
            }
            Err(e) => {
                job.record_failure();
                warn!("Job {} attempt {} failed: {:#}", job.name(), attempt, e);
                sink.line(format!("attempt {} failed: {:#}", attempt, e));
                metrics.job_attempt_failed(job.name());
            }
        }

        if cancel.is_cancelled() {
            return JobOutcome::Cancelled;
        }
    }
}

/// Removes the job from the active registry and publishes its outcome
///
/// Runs only once no attempt is in flight. The registry is updated before
/// waiters are released so that a caller returning from `wait` observes
/// the job as no longer active.
fn complete(inner: &ExecutorInner, job: &JobHandle, outcome: JobOutcome) {
    {
        let mut registry = inner.registry.lock().unwrap();
        let is_current = registry
            .active
            .get(job.name())
            .is_some_and(|active| active.same_job(job));
        if is_current {
            registry.active.remove(job.name());
        }
        if outcome == JobOutcome::Cancelled {
            registry
                .last_failed
                .insert(job.name().to_string(), job.clone());
        }
    }

    inner.metrics.job_finished(
        job.name(),
        outcome == JobOutcome::Succeeded,
        job.elapsed(),
    );

    info!(
        "[{}] Job {} started at {} finished: {} after {} attempt(s) in {:?}",
        inner.label,
        job.name(),
        job.started_at().format("%H:%M:%S"),
        outcome,
        job.attempts(),
        job.elapsed()
    );

    job.finish(outcome);
}
