//! Keel Core
//!
//! Core types and abstractions for the Keel control plane.
//!
//! This crate contains:
//! - Domain types: lifecycle resources (Cluster, Workspace), watched workloads
//! - State machines: lifecycle states and derived readiness
//! - Shared helpers: error taxonomy, retry backoff, naming rules, metrics sink

pub mod backoff;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod naming;

pub use error::{ControlError, Result};
