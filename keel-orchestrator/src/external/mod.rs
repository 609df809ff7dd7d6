//! External collaborators
//!
//! Interfaces to the systems the control plane drives: the API holding
//! derived sub-objects of watched workloads, and the provisioning backend
//! running apply/destroy steps.

pub mod memory;
pub mod shell;

use async_trait::async_trait;
use keel_core::Result;
use keel_core::domain::ResourceKey;
use keel_runner::LogSink;
use std::collections::BTreeMap;
use std::path::Path;

pub use memory::InMemoryApiClient;
pub use shell::ShellProvisioner;

/// Kinds of derived sub-objects created for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Deployment,
    Service,
    RouteRules,
    VolumeClaim,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Deployment => write!(f, "Deployment"),
            ObjectKind::Service => write!(f, "Service"),
            ObjectKind::RouteRules => write!(f, "RouteRules"),
            ObjectKind::VolumeClaim => write!(f, "VolumeClaim"),
        }
    }
}

/// A derived sub-object as seen by the external API
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedObject {
    pub kind: ObjectKind,
    pub key: ResourceKey,
    pub spec: serde_json::Value,

    /// Status reported by the external system (e.g. `readyReplicas`)
    pub status: serde_json::Value,
}

impl DerivedObject {
    /// Creates an object with an empty status
    pub fn new(kind: ObjectKind, key: ResourceKey, spec: serde_json::Value) -> Self {
        Self {
            kind,
            key,
            spec,
            status: serde_json::Value::Null,
        }
    }

    /// Ready replica count reported in the status, zero if absent
    ///
    /// Negative counts read as zero and counts beyond `i32` saturate.
    pub fn ready_replicas(&self) -> i32 {
        self.status
            .get("readyReplicas")
            .and_then(|v| v.as_i64())
            .map(|v| i32::try_from(v.max(0)).unwrap_or(i32::MAX))
            .unwrap_or(0)
    }
}

/// Client for derived sub-objects, keyed by kind and namespace/name
#[async_trait]
pub trait ExternalApiClient: Send + Sync {
    /// Fetches an object; `Ok(None)` if it does not exist
    async fn get(&self, kind: ObjectKind, key: &ResourceKey) -> Result<Option<DerivedObject>>;

    /// Creates an object, failing with `AlreadyExists` if present
    async fn create(&self, object: &DerivedObject) -> Result<()>;

    /// Replaces an object's spec, failing with `NotFound` if absent
    async fn update(&self, object: &DerivedObject) -> Result<()>;

    /// Deletes an object, failing with `NotFound` if absent
    async fn delete(&self, kind: ObjectKind, key: &ResourceKey) -> Result<()>;
}

/// Backend running the provisioning steps for clusters and workspaces
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    /// Creates the remote state workspace/lock for `name`
    ///
    /// Fails with `AlreadyExists` if it is already there.
    async fn create_workspace(&self, name: &str) -> Result<()>;

    /// Deletes the remote workspace if it holds no resources
    ///
    /// Returns whether it was deleted. A missing workspace counts as deleted.
    async fn delete_workspace_if_empty(&self, name: &str) -> Result<bool>;

    /// Releases a stale state lock left by an interrupted run
    async fn force_unlock(&self, name: &str) -> Result<()>;

    /// Runs the apply step, streaming its output into `log`
    ///
    /// Returns the process exit code.
    async fn apply(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32>;

    /// Runs the destroy step, streaming its output into `log`
    ///
    /// Returns the process exit code.
    async fn destroy(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32>;
}
