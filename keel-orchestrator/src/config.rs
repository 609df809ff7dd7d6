//! Orchestrator configuration
//!
//! Defines capacity limits, job timeouts, reconciliation pacing and the
//! locations of the provisioning scripts and working directories.

use keel_runner::ExecutorConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string; the in-memory store is used when absent
    pub database_url: Option<String>,

    /// Directory holding the provisioning step scripts
    pub scripts_dir: PathBuf,

    /// Root of the per-kind provisioning working directories
    pub work_dir: PathBuf,

    /// Deadline for a cluster provisioning job
    pub cluster_job_timeout: Duration,

    /// Deadline for a workspace provisioning job
    pub workspace_job_timeout: Duration,

    /// Maximum number of clusters
    pub max_clusters: usize,

    /// Maximum number of workspaces
    pub max_workspaces: usize,

    /// Delay before a failed reconciliation pass is retried
    pub reconcile_retry_delay: Duration,

    /// Capacity of each resource key's signal queue
    pub reconcile_queue_capacity: usize,

    /// How often every watched workload is re-queued
    pub resync_interval: Duration,

    /// How often drain checks for in-flight jobs
    pub drain_poll_interval: Duration,

    /// Report derived deployments ready as soon as they are written
    ///
    /// Derived objects live in an in-process API with no controller behind
    /// it, so without this flag workloads never leave `Pending`.
    pub simulate_ready: bool,

    /// Job retry pacing and log limits
    pub executor: ExecutorConfig,
}

impl Config {
    /// Creates a configuration with defaults
    pub fn new(scripts_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            database_url: None,
            scripts_dir,
            work_dir,
            cluster_job_timeout: Duration::from_secs(2 * 60 * 60),
            workspace_job_timeout: Duration::from_secs(30 * 60),
            max_clusters: 5,
            max_workspaces: 50,
            reconcile_retry_delay: Duration::from_secs(10),
            reconcile_queue_capacity: 100,
            resync_interval: Duration::from_secs(60),
            drain_poll_interval: Duration::from_secs(1),
            simulate_ready: false,
            executor: ExecutorConfig::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Optional environment variables:
    /// - DATABASE_URL (default: unset, in-memory store)
    /// - KEEL_SCRIPTS_DIR (default: ./scripts)
    /// - KEEL_WORK_DIR (default: ./terraform)
    /// - CLUSTER_JOB_TIMEOUT (seconds, default: 7200)
    /// - WORKSPACE_JOB_TIMEOUT (seconds, default: 1800)
    /// - MAX_CLUSTERS (default: 5)
    /// - MAX_WORKSPACES (default: 50)
    /// - RECONCILE_RETRY_DELAY (seconds, default: 10)
    /// - RECONCILE_QUEUE_CAPACITY (default: 100)
    /// - RESYNC_INTERVAL (seconds, default: 60)
    /// - DRAIN_POLL_INTERVAL (milliseconds, default: 1000)
    /// - KEEL_SIMULATE_READY (true/false, default: false)
    /// - BACKOFF_UNIT (seconds, default: 10)
    /// - JOB_LOG_CAPACITY (lines, default: 5000)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let scripts_dir = std::env::var("KEEL_SCRIPTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.scripts_dir);

        let work_dir = std::env::var("KEEL_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.work_dir);

        Ok(Self {
            database_url,
            scripts_dir,
            work_dir,
            cluster_job_timeout: env_secs("CLUSTER_JOB_TIMEOUT")?
                .unwrap_or(defaults.cluster_job_timeout),
            workspace_job_timeout: env_secs("WORKSPACE_JOB_TIMEOUT")?
                .unwrap_or(defaults.workspace_job_timeout),
            max_clusters: env_parse("MAX_CLUSTERS")?.unwrap_or(defaults.max_clusters),
            max_workspaces: env_parse("MAX_WORKSPACES")?.unwrap_or(defaults.max_workspaces),
            reconcile_retry_delay: env_secs("RECONCILE_RETRY_DELAY")?
                .unwrap_or(defaults.reconcile_retry_delay),
            reconcile_queue_capacity: env_parse("RECONCILE_QUEUE_CAPACITY")?
                .unwrap_or(defaults.reconcile_queue_capacity),
            resync_interval: env_secs("RESYNC_INTERVAL")?.unwrap_or(defaults.resync_interval),
            drain_poll_interval: env_parse::<u64>("DRAIN_POLL_INTERVAL")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.drain_poll_interval),
            simulate_ready: env_parse("KEEL_SIMULATE_READY")?.unwrap_or(defaults.simulate_ready),
            executor: ExecutorConfig::from_env(),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_clusters == 0 {
            anyhow::bail!("max_clusters must be greater than 0");
        }

        if self.max_workspaces == 0 {
            anyhow::bail!("max_workspaces must be greater than 0");
        }

        if self.cluster_job_timeout.is_zero() || self.workspace_job_timeout.is_zero() {
            anyhow::bail!("job timeouts must be greater than 0");
        }

        if self.reconcile_queue_capacity == 0 {
            anyhow::bail!("reconcile_queue_capacity must be greater than 0");
        }

        if self.resync_interval.is_zero() {
            anyhow::bail!("resync_interval must be greater than 0");
        }

        if self.drain_poll_interval.is_zero() {
            anyhow::bail!("drain_poll_interval must be greater than 0");
        }

        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                anyhow::bail!("database_url must start with postgres:// or postgresql://");
            }
        }

        self.executor.validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(PathBuf::from("./scripts"), PathBuf::from("./terraform"))
    }
}

/// Parses an optional environment variable, rejecting malformed values
fn env_parse<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value for {}: '{}' ({})", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn env_secs(name: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_secs))
}
