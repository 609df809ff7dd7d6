//! Watched workload objects
//!
//! A workload is an externally-owned object (e.g. a notebook server) that
//! the dispatcher keeps in sync with its derived sub-objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::readiness::ReadinessState;

/// Finalizer marker placed on every workload the control plane manages
pub const FINALIZER: &str = "keel.dev/cleanup";

/// Unique namespace/name identifying a watched object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata relevant to reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Set once the owner has asked for the object to be deleted
    #[serde(default)]
    pub deletion_requested: bool,
}

/// Desired state of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub image: String,
    pub replicas: i32,
    pub port: u16,

    /// Public host routed to the workload, if exposed
    #[serde(default)]
    pub host: Option<String>,

    /// Size of the persistent volume, if any
    #[serde(default)]
    pub storage_gib: Option<u32>,
}

/// Observed state of a workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub state: ReadinessState,
    pub ready_replicas: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

/// A watched workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub metadata: ObjectMeta,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Adds the control-plane finalizer; returns false if it was already present
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() {
            return false;
        }
        self.metadata.finalizers.push(FINALIZER.to_string());
        true
    }

    /// Removes the control-plane finalizer; returns false if it was absent
    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.metadata.finalizers.len();
        self.metadata.finalizers.retain(|f| f != FINALIZER);
        self.metadata.finalizers.len() != before
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload() -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: "nb".to_string(),
                namespace: "team".to_string(),
                ..Default::default()
            },
            spec: WorkloadSpec {
                image: "jupyter:latest".to_string(),
                replicas: 1,
                port: 8888,
                host: None,
                storage_gib: None,
            },
            status: WorkloadStatus::default(),
        }
    }

    #[test]
    fn test_finalizer_add_remove() {
        let mut w = workload();
        assert!(!w.has_finalizer());
        assert!(w.add_finalizer());
        assert!(!w.add_finalizer());
        assert_eq!(w.metadata.finalizers, vec![FINALIZER.to_string()]);
        assert!(w.remove_finalizer());
        assert!(!w.remove_finalizer());
    }

    #[test]
    fn test_key_display() {
        assert_eq!(workload().key().to_string(), "team/nb");
    }
}
