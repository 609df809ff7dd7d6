//! Keel Orchestrator
//!
//! Control plane for long-running provisioning operations.
//!
//! Architecture:
//! - Configuration: capacity limits, timeouts and pacing from the environment
//! - Repositories: the durable store behind a narrow keyed interface
//! - External: the derived-object API and the provisioning backend
//! - Dispatcher: per-key coalescing reconciliation of watched workloads
//! - Services: lifecycle controllers for clusters and workspaces, recovery
//!   and drain

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod external;
pub mod metrics;
pub mod repository;
pub mod service;

#[cfg(test)]
mod testing;
