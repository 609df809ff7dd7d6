//! Lifecycle resources
//!
//! Clusters and workspaces are provisioned asynchronously. Their status
//! records the current lifecycle state together with the previous one.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle state of a provisioned resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    #[default]
    Unknown,
    Creating,
    Updating,
    Ready,
    Failed,
    Deleting,
    Deleted,
}

impl LifecycleState {
    /// States in which a provisioning job is expected to be in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LifecycleState::Unknown
                | LifecycleState::Creating
                | LifecycleState::Updating
                | LifecycleState::Deleting
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Unknown => write!(f, "Unknown"),
            LifecycleState::Creating => write!(f, "Creating"),
            LifecycleState::Updating => write!(f, "Updating"),
            LifecycleState::Ready => write!(f, "Ready"),
            LifecycleState::Failed => write!(f, "Failed"),
            LifecycleState::Deleting => write!(f, "Deleting"),
            LifecycleState::Deleted => write!(f, "Deleted"),
        }
    }
}

/// Observed status of a lifecycle resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub last_state: LifecycleState,
    pub state: LifecycleState,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Status {
    /// Creates a status in the given state with no history
    pub fn new(state: LifecycleState) -> Self {
        Self {
            last_state: LifecycleState::Unknown,
            state,
            updated_at: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    /// Moves to `next`, remembering the current state and refreshing the timestamp
    pub fn transition(&mut self, next: LifecycleState) {
        self.last_state = self.state;
        self.state = next;
        self.updated_at = Utc::now();
    }
}

/// Desired configuration of a lifecycle resource kind
///
/// Identity fields (name, parent, region) never change after creation;
/// `apply_update` copies only the mutable subset.
pub trait LifecycleSpec:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Singular kind name, used in logs and as the provisioning directory
    const KIND: &'static str;

    /// Plural kind name, used in capacity errors and table names
    const PLURAL: &'static str;

    /// Whether `-` is allowed in names of this kind
    const ALLOW_DASH: bool;

    /// Unique resource name
    fn name(&self) -> &str;

    /// Name of the owning parent resource, if any
    fn parent(&self) -> Option<&str> {
        None
    }

    /// Git ref of the provisioning code to apply
    fn git_ref(&self) -> &str;

    /// Copies the allow-listed mutable fields from `desired`
    fn apply_update(&mut self, desired: &Self);

    /// Variables handed to the provisioning scripts
    fn provisioning_env(&self) -> BTreeMap<String, String>;
}

/// A persisted lifecycle resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "S: LifecycleSpec")]
pub struct Resource<S: LifecycleSpec> {
    pub spec: S,
    pub status: Status,

    /// Names of child resources owned by this one
    #[serde(default)]
    pub members: BTreeSet<String>,
}

impl<S: LifecycleSpec> Resource<S> {
    /// Creates a resource in the given state
    pub fn new(spec: S, state: LifecycleState) -> Self {
        Self {
            spec,
            status: Status::new(state),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn state(&self) -> LifecycleState {
        self.status.state
    }

    /// Records a state change (see [`Status::transition`])
    pub fn set_state(&mut self, state: LifecycleState) {
        self.status.transition(state);
    }
}

// =============================================================================
// Cluster
// =============================================================================

/// Desired configuration of a compute cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub name: String,
    pub region: String,
    pub git_ref: String,
    pub node_count: u32,
}

impl LifecycleSpec for ClusterSpec {
    const KIND: &'static str = "cluster";
    const PLURAL: &'static str = "clusters";
    const ALLOW_DASH: bool = true;

    fn name(&self) -> &str {
        &self.name
    }

    fn git_ref(&self) -> &str {
        &self.git_ref
    }

    fn apply_update(&mut self, desired: &Self) {
        self.git_ref = desired.git_ref.clone();
        self.node_count = desired.node_count;
    }

    fn provisioning_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("TF_VAR_cluster_name".to_string(), self.name.clone()),
            ("TF_VAR_region".to_string(), self.region.clone()),
            ("TF_VAR_node_count".to_string(), self.node_count.to_string()),
            ("TF_VAR_git_ref".to_string(), self.git_ref.clone()),
        ])
    }
}

pub type Cluster = Resource<ClusterSpec>;

// =============================================================================
// Workspace
// =============================================================================

/// Resource quota granted to a workspace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceQuota {
    pub cpu: u32,
    pub memory_gib: u32,
    pub gpu: u32,
}

/// Desired configuration of a workspace hosted on a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub name: String,
    pub cluster: String,
    pub git_ref: String,
    #[serde(default)]
    pub quota: WorkspaceQuota,
    pub image_tag: String,
}

impl LifecycleSpec for WorkspaceSpec {
    const KIND: &'static str = "workspace";
    const PLURAL: &'static str = "workspaces";
    const ALLOW_DASH: bool = false;

    fn name(&self) -> &str {
        &self.name
    }

    fn parent(&self) -> Option<&str> {
        Some(&self.cluster)
    }

    fn git_ref(&self) -> &str {
        &self.git_ref
    }

    fn apply_update(&mut self, desired: &Self) {
        self.git_ref = desired.git_ref.clone();
        self.quota = desired.quota;
        self.image_tag = desired.image_tag.clone();
    }

    fn provisioning_env(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("TF_VAR_workspace_name".to_string(), self.name.clone()),
            ("TF_VAR_cluster_name".to_string(), self.cluster.clone()),
            ("TF_VAR_git_ref".to_string(), self.git_ref.clone()),
            ("TF_VAR_quota_cpu".to_string(), self.quota.cpu.to_string()),
            (
                "TF_VAR_quota_memory_gib".to_string(),
                self.quota.memory_gib.to_string(),
            ),
            ("TF_VAR_quota_gpu".to_string(), self.quota.gpu.to_string()),
            ("TF_VAR_image_tag".to_string(), self.image_tag.clone()),
        ])
    }
}

pub type Workspace = Resource<WorkspaceSpec>;
