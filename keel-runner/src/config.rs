//! Executor configuration
//!
//! Defines the pacing of job retries and the size of job logs.

use keel_core::backoff;
use std::time::Duration;

use crate::service::DEFAULT_LOG_CAPACITY;

/// Executor configuration
///
/// The backoff unit is configurable so tests and development setups can
/// retry in milliseconds instead of tens of seconds.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Multiplier applied to each backoff step
    pub backoff_unit: Duration,

    /// Maximum number of backoff steps (delay = min(n², cap) * unit)
    pub backoff_cap: u32,

    /// Maximum number of log lines retained per job
    pub log_capacity: usize,
}

impl ExecutorConfig {
    /// Creates a configuration with the given backoff unit and default limits
    pub fn new(backoff_unit: Duration) -> Self {
        Self {
            backoff_unit,
            backoff_cap: backoff::DEFAULT_CAP,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Optional environment variables:
    /// - BACKOFF_UNIT (seconds, default: 10)
    /// - JOB_LOG_CAPACITY (lines, default: 5000)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(unit) = std::env::var("BACKOFF_UNIT")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.backoff_unit = Duration::from_secs(unit);
        }

        if let Some(capacity) = std::env::var("JOB_LOG_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.log_capacity = capacity;
        }

        config
    }

    /// Backoff before the attempt following `failures` failed attempts
    pub fn backoff(&self, failures: u32) -> Duration {
        backoff::backoff_with(failures, self.backoff_unit, self.backoff_cap)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_capacity == 0 {
            anyhow::bail!("log_capacity must be greater than 0");
        }

        if self.backoff_cap == 0 {
            anyhow::bail!("backoff_cap must be greater than 0");
        }

        Ok(())
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::new(backoff::DEFAULT_UNIT)
    }
}
