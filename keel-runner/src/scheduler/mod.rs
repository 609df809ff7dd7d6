//! Scheduler layer for the runner
//!
//! This layer owns the registry of named jobs and drives each job's
//! retry loop from submission to completion.

pub mod executor;
pub mod job;

pub use executor::{ExecutorLock, JobExecutor};
pub use job::{JobHandle, JobOutcome};
