//! Core domain types
//!
//! This module contains the domain structures shared by the executor and
//! the orchestrator. Persistence lives behind the orchestrator's store
//! traits; these types are structure plus state-machine rules only.

pub mod readiness;
pub mod resource;
pub mod workload;

pub use readiness::{ReadinessState, transition_state};
pub use resource::{
    Cluster, ClusterSpec, LifecycleSpec, LifecycleState, Resource, Status, Workspace,
    WorkspaceQuota, WorkspaceSpec,
};
pub use workload::{FINALIZER, ObjectMeta, ResourceKey, Workload, WorkloadSpec, WorkloadStatus};
