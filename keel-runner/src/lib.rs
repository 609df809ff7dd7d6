//! Keel Runner
//!
//! Asynchronous job executor for long-running provisioning operations.
//!
//! Architecture:
//! - Configuration: backoff pacing and log capacity
//! - Services: bounded log buffering and the log sink handed to work functions
//! - Scheduler: the named-job registry and per-job retry loop
//!
//! At most one job runs per name. A job retries its work function with
//! quadratic backoff until it succeeds or its deadline elapses.

pub mod config;
pub mod scheduler;
pub mod service;

pub use config::ExecutorConfig;
pub use scheduler::{ExecutorLock, JobExecutor, JobHandle, JobOutcome};
pub use service::{BoundedLogBuffer, LogBufferService, LogSink};
