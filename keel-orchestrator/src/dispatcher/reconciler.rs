//! Reconciler interface driven by the dispatcher

use async_trait::async_trait;
use keel_core::domain::ResourceKey;

/// Result of a successful reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Derived objects were brought in line with the resource
    Applied,

    /// The resource is gone and its owned objects were released
    Finalized,
}

/// One evaluation-and-correction pass for a resource key
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &ResourceKey) -> anyhow::Result<ReconcileOutcome>;
}
