//! Control plane
//!
//! Groups the cluster and workspace controllers and provides the
//! operations that span both: startup recovery and drain.

use keel_core::Result;
use keel_core::metrics::MetricsSink;
use keel_runner::{ExecutorLock, JobExecutor};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::lifecycle::{ClusterController, LifecycleSettings, WorkspaceController};
use crate::config::Config;
use crate::external::ProvisioningBackend;
use crate::repository::Stores;

/// Guard keeping the control plane drained
///
/// New jobs are refused until the guard is released or dropped.
pub struct DrainGuard {
    clusters: ExecutorLock,
    workspaces: ExecutorLock,
}

impl DrainGuard {
    /// Lets job submissions resume
    pub fn release(self) {
        self.workspaces.unlock();
        self.clusters.unlock();
        info!("Control plane resumed");
    }
}

/// Cluster and workspace controllers sharing one provisioning backend
#[derive(Clone)]
pub struct ControlPlane {
    pub clusters: ClusterController,
    pub workspaces: WorkspaceController,
}

impl ControlPlane {
    /// Builds both controllers from configuration
    pub fn new(
        config: &Config,
        stores: &Stores,
        backend: Arc<dyn ProvisioningBackend>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let clusters = ClusterController::new(
            Arc::clone(&stores.clusters),
            JobExecutor::new("cluster", config.executor.clone(), Arc::clone(&metrics)),
            Arc::clone(&backend),
            LifecycleSettings {
                max_resources: config.max_clusters,
                job_timeout: config.cluster_job_timeout,
                work_dir: config.work_dir.clone(),
            },
        );

        let workspaces = WorkspaceController::new(
            Arc::clone(&stores.workspaces),
            JobExecutor::new("workspace", config.executor.clone(), metrics),
            backend,
            LifecycleSettings {
                max_resources: config.max_workspaces,
                job_timeout: config.workspace_job_timeout,
                work_dir: config.work_dir.clone(),
            },
        )
        .with_parents(Arc::clone(&stores.clusters));

        Self {
            clusters,
            workspaces,
        }
    }

    /// Resumes interrupted operations, clusters before workspaces
    pub async fn recover(&self) -> Result<usize> {
        let clusters = self.clusters.recover().await?;
        let workspaces = self.workspaces.recover().await?;
        info!(
            "Recovery resumed {} cluster(s) and {} workspace(s)",
            clusters, workspaces
        );
        Ok(clusters + workspaces)
    }

    /// Number of provisioning jobs in flight
    pub fn count_jobs(&self) -> usize {
        self.clusters.executor().count_jobs() + self.workspaces.executor().count_jobs()
    }

    /// Blocks new jobs and waits for in-flight ones to finish
    pub async fn drain(&self, poll_interval: Duration) -> DrainGuard {
        let clusters = self.clusters.executor().lock().await;
        let workspaces = self.workspaces.executor().lock().await;

        loop {
            if self.count_jobs() == 0 {
                break;
            }
            let mut in_flight = self.clusters.executor().active_jobs();
            in_flight.extend(self.workspaces.executor().active_jobs());
            info!("Draining, waiting for {}", in_flight.join(", "));
            tokio::time::sleep(poll_interval).await;
        }

        info!("Control plane drained");
        DrainGuard {
            clusters,
            workspaces,
        }
    }
}
