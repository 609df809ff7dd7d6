//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Lifecycle controllers drive provisioning jobs; the control plane groups
//! them for recovery and drain.

pub mod control_plane;
pub mod lifecycle;

pub use control_plane::{ControlPlane, DrainGuard};
pub use lifecycle::{ClusterController, LifecycleController, LifecycleSettings, WorkspaceController};
