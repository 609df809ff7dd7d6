//! Lifecycle controller
//!
//! Create, update and delete for provisioned resources (clusters and
//! workspaces). Each operation persists the intended state first and then
//! submits a job that drives the provisioning backend; the job marks the
//! resource Ready on success and Failed when its deadline elapses.
//!
//! A job whose deadline passes while an attempt is still running is settled
//! once: either the timeout marks the resource Failed, or the attempt had
//! already committed its result, never both.
//!
//! Every operation is idempotent, so startup recovery simply re-invokes the
//! same entry points for resources left in an in-flight state.

use anyhow::Context;
use keel_core::domain::{Cluster, LifecycleSpec, LifecycleState, Resource};
use keel_core::naming::validate_name;
use keel_core::{ControlError, Result};
use keel_runner::{JobExecutor, LogSink};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::external::ProvisioningBackend;
use crate::repository::ResourceStore;

/// Status property recording the git ref of the last successful apply
pub const APPLIED_REF: &str = "applied_ref";

/// Status property recording why the last job failed
pub const LAST_ERROR: &str = "last_error";

/// Which side of a job wrote its final state
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    #[default]
    Pending,
    Committed,
    TimedOut,
}

type SharedSettlement = Arc<Mutex<Settlement>>;

/// Per-kind limits and locations
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Maximum number of resources of this kind
    pub max_resources: usize,

    /// Deadline for each provisioning job
    pub job_timeout: Duration,

    /// Root of the provisioning working directories
    pub work_dir: PathBuf,
}

/// Lifecycle controller for one resource kind
pub struct LifecycleController<S: LifecycleSpec> {
    store: Arc<dyn ResourceStore<Resource<S>>>,
    parents: Option<Arc<dyn ResourceStore<Cluster>>>,
    executor: JobExecutor,
    backend: Arc<dyn ProvisioningBackend>,
    settings: Arc<LifecycleSettings>,
}

pub type ClusterController = LifecycleController<keel_core::domain::ClusterSpec>;
pub type WorkspaceController = LifecycleController<keel_core::domain::WorkspaceSpec>;

impl<S: LifecycleSpec> Clone for LifecycleController<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            parents: self.parents.clone(),
            executor: self.executor.clone(),
            backend: Arc::clone(&self.backend),
            settings: Arc::clone(&self.settings),
        }
    }
}

impl<S: LifecycleSpec> LifecycleController<S> {
    /// Creates a new controller
    ///
    /// # Arguments
    /// * `store` - Persisted resources of this kind
    /// * `executor` - Runs the provisioning jobs
    /// * `backend` - Provisioning steps
    /// * `settings` - Capacity, timeout and working directory
    pub fn new(
        store: Arc<dyn ResourceStore<Resource<S>>>,
        executor: JobExecutor,
        backend: Arc<dyn ProvisioningBackend>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            parents: None,
            executor,
            backend,
            settings: Arc::new(settings),
        }
    }

    /// Records membership of each resource in its parent cluster
    pub fn with_parents(mut self, parents: Arc<dyn ResourceStore<Cluster>>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub async fn get(&self, name: &str) -> Result<Resource<S>> {
        self.store.get(name).await
    }

    pub async fn list(&self) -> Result<Vec<Resource<S>>> {
        self.store.list().await
    }

    /// Log of the running job for `name`, or of its last failed job
    pub fn job_log(&self, name: &str) -> Option<String> {
        self.executor
            .get_job(name)
            .or_else(|| self.executor.get_last_failed_job(name))
            .map(|job| job.get_log())
    }

    /// Creates a resource, or resumes an interrupted creation
    pub async fn create(&self, spec: S) -> Result<()> {
        validate_name(spec.name(), S::ALLOW_DASH)?;
        if spec.git_ref().trim().is_empty() {
            return Err(ControlError::Validation(format!(
                "{} {} has no git ref",
                S::KIND,
                spec.name()
            )));
        }

        let name = spec.name().to_string();
        let resource = match self.store.get(&name).await {
            Ok(existing) => match existing.state() {
                LifecycleState::Creating | LifecycleState::Unknown => {
                    info!("Resuming creation of {} {}", S::KIND, name);
                    self.attach_to_parent(&existing.spec).await?;
                    existing
                }
                state => {
                    return Err(ControlError::AlreadyExists(format!(
                        "{} {} is {}",
                        S::KIND,
                        name,
                        state
                    )));
                }
            },
            Err(e) if e.is_not_found() => {
                if self.executor.get_job(&name).is_some() {
                    return Err(ControlError::AlreadyRunning(name));
                }

                let count = self.store.list().await?.len();
                if count >= self.settings.max_resources {
                    return Err(ControlError::CapacityExceeded {
                        kind: S::PLURAL,
                        max: self.settings.max_resources,
                    });
                }

                self.load_parent(&spec).await?;

                let resource = Resource::new(spec, LifecycleState::Creating);
                self.store.create(&name, &resource).await?;

                if let Err(e) = self.attach_to_parent(&resource.spec).await {
                    if let Err(rollback) = self.store.delete(&name).await {
                        warn!("Failed to roll back {} {}: {}", S::KIND, name, rollback);
                    }
                    return Err(e);
                }

                info!("Accepted {} {}", S::KIND, name);
                resource
            }
            Err(e) => return Err(e),
        };

        match self.backend.create_workspace(&name).await {
            Ok(()) => debug!("Created remote workspace {}", name),
            Err(e) if e.is_already_exists() => debug!("Remote workspace {} already exists", name),
            Err(e) => return Err(e),
        }

        self.submit_apply(resource.name()).await
    }

    /// Applies the mutable fields of `desired` and re-runs provisioning
    pub async fn update(&self, desired: S) -> Result<()> {
        if desired.git_ref().trim().is_empty() {
            return Err(ControlError::Validation(format!(
                "{} {} has no git ref",
                S::KIND,
                desired.name()
            )));
        }

        let name = desired.name().to_string();
        let mut resource = self.store.get(&name).await?;

        if self.executor.get_job(&name).is_some() {
            return Err(ControlError::AlreadyRunning(name));
        }

        if matches!(
            resource.state(),
            LifecycleState::Deleting | LifecycleState::Deleted
        ) {
            return Err(ControlError::Validation(format!(
                "{} {} is {}",
                S::KIND,
                name,
                resource.state()
            )));
        }

        resource.spec.apply_update(&desired);
        resource.set_state(LifecycleState::Updating);
        self.store.update(&name, &resource).await?;
        info!("Updating {} {} to {}", S::KIND, name, resource.spec.git_ref());

        self.submit_apply(&name).await
    }

    /// Destroys a resource and erases its record
    ///
    /// Deleting an absent or already deleted resource succeeds.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let resource = match self.store.get(name).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                debug!("{} {} already gone", S::KIND, name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if resource.state() == LifecycleState::Deleted {
            return Ok(());
        }

        if !resource.members.is_empty() {
            let members: Vec<&str> = resource.members.iter().map(String::as_str).collect();
            return Err(ControlError::Validation(format!(
                "{} {} still hosts {}",
                S::KIND,
                name,
                members.join(", ")
            )));
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let settlement = SharedSettlement::default();
        let this = self.clone();
        let job_name = name.to_string();
        let job_settlement = Arc::clone(&settlement);
        let work = move |log: LogSink| {
            let this = this.clone();
            let name = job_name.clone();
            let settlement = Arc::clone(&job_settlement);
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { this.run_delete(&name, attempt, &settlement, &log).await }
        };

        let this = self.clone();
        let failed_name = name.to_string();
        let on_timeout = move || async move { this.mark_failed(&failed_name, &settlement).await };

        self.executor
            .create_job(self.settings.job_timeout, name, work, on_timeout)
            .await?;

        info!("Deleting {} {}", S::KIND, name);
        Ok(())
    }

    /// Resumes operations interrupted by a restart
    ///
    /// Returns the number of resources whose operation was resumed. Failing
    /// to list the store is fatal; a failed resume is logged and skipped.
    pub async fn recover(&self) -> Result<usize> {
        let resources = self.store.list().await?;
        let mut resumed = 0;

        for resource in resources {
            let name = resource.name().to_string();
            let state = resource.state();

            if !state.is_in_flight() {
                continue;
            }

            let result = match state {
                LifecycleState::Updating => self.update(resource.spec).await,
                LifecycleState::Deleting => self.delete(&name).await,
                _ => self.create(resource.spec).await,
            };

            match result {
                Ok(()) => {
                    info!("Resumed {} {} ({})", S::KIND, name, state);
                    resumed += 1;
                }
                Err(e) if e.is_benign() => {
                    debug!("{} {} already in progress: {}", S::KIND, name, e);
                    resumed += 1;
                }
                Err(e) => warn!("Failed to resume {} {} ({}): {}", S::KIND, name, state, e),
            }
        }

        Ok(resumed)
    }

    /// Submits the apply job for `name`
    async fn submit_apply(&self, name: &str) -> Result<()> {
        let attempts = Arc::new(AtomicU32::new(0));
        let settlement = SharedSettlement::default();
        let this = self.clone();
        let job_name = name.to_string();
        let job_settlement = Arc::clone(&settlement);
        let work = move |log: LogSink| {
            let this = this.clone();
            let name = job_name.clone();
            let settlement = Arc::clone(&job_settlement);
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { this.run_apply(&name, attempt, &settlement, &log).await }
        };

        let this = self.clone();
        let failed_name = name.to_string();
        let on_timeout = move || async move { this.mark_failed(&failed_name, &settlement).await };

        self.executor
            .create_job(self.settings.job_timeout, name, work, on_timeout)
            .await?;
        Ok(())
    }

    /// One attempt of the apply job
    async fn run_apply(
        &self,
        name: &str,
        attempt: u32,
        settlement: &SharedSettlement,
        log: &LogSink,
    ) -> anyhow::Result<()> {
        let mut resource = self
            .store
            .get(name)
            .await
            .with_context(|| format!("Failed to load {} {}", S::KIND, name))?;

        if attempt > 1 {
            self.unlock(name, log).await;
        }

        let git_ref = resource.spec.git_ref().to_string();
        log.line(format!("applying {} {} at {}", S::KIND, name, git_ref));

        let dir = self.prepare_working_dir(name).await?;
        let code = self
            .backend
            .apply(&dir, &self.env(&resource.spec, name), log)
            .await?;
        if code != 0 {
            return Err(ControlError::external("apply", code).into());
        }

        let mut settled = settlement.lock().await;
        if *settled == Settlement::TimedOut {
            log.line("deadline passed, discarding apply result");
            warn!("{} {} applied after its deadline", S::KIND, name);
            return Ok(());
        }

        resource
            .status
            .properties
            .insert(APPLIED_REF.to_string(), git_ref);
        resource.status.properties.remove(LAST_ERROR);
        resource.set_state(LifecycleState::Ready);
        self.store
            .update_status(name, &resource)
            .await
            .with_context(|| format!("Failed to mark {} {} ready", S::KIND, name))?;
        *settled = Settlement::Committed;
        drop(settled);

        log.line(format!("{} {} is ready", S::KIND, name));
        info!("{} {} is ready", S::KIND, name);
        Ok(())
    }

    /// One attempt of the delete job
    async fn run_delete(
        &self,
        name: &str,
        attempt: u32,
        settlement: &SharedSettlement,
        log: &LogSink,
    ) -> anyhow::Result<()> {
        let mut resource = match self.store.get(name).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                log.line(format!("{} {} already removed", S::KIND, name));
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to load {} {}", S::KIND, name));
            }
        };

        if resource.state() != LifecycleState::Deleting {
            resource.set_state(LifecycleState::Deleting);
            self.store
                .update_status(name, &resource)
                .await
                .with_context(|| format!("Failed to mark {} {} deleting", S::KIND, name))?;
        }

        if attempt > 1 {
            self.unlock(name, log).await;
        }

        log.line(format!("destroying {} {}", S::KIND, name));
        let dir = self.prepare_working_dir(name).await?;
        let code = self
            .backend
            .destroy(&dir, &self.env(&resource.spec, name), log)
            .await?;
        if code != 0 {
            return Err(ControlError::external("destroy", code).into());
        }

        self.detach_from_parent(&resource.spec, log).await;

        let deleted = self
            .backend
            .delete_workspace_if_empty(name)
            .await
            .with_context(|| format!("Failed to delete remote workspace {}", name))?;
        if !deleted {
            anyhow::bail!("remote workspace {} still holds resources", name);
        }

        let mut settled = settlement.lock().await;
        if *settled == Settlement::TimedOut {
            log.line("deadline passed, keeping the record");
            warn!("{} {} destroyed after its deadline", S::KIND, name);
            return Ok(());
        }

        match self.store.delete(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to erase {} {}", S::KIND, name));
            }
        }
        *settled = Settlement::Committed;
        drop(settled);

        log.line(format!("{} {} deleted", S::KIND, name));
        info!("{} {} deleted", S::KIND, name);
        Ok(())
    }

    /// Marks the resource Failed after its job ran out of time
    ///
    /// Does nothing if the job already committed its result.
    async fn mark_failed(&self, name: &str, settlement: &SharedSettlement) {
        let mut settled = settlement.lock().await;
        if *settled == Settlement::Committed {
            debug!("{} {} settled before its deadline", S::KIND, name);
            return;
        }
        *settled = Settlement::TimedOut;

        let mut resource = match self.store.get(name).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => return,
            Err(e) => {
                warn!("Failed to load {} {} after timeout: {}", S::KIND, name, e);
                return;
            }
        };

        let reason = ControlError::Timeout(format!(
            "{} {} did not settle within {:?}",
            S::KIND,
            name,
            self.settings.job_timeout
        ));
        resource
            .status
            .properties
            .insert(LAST_ERROR.to_string(), reason.to_string());
        resource.set_state(LifecycleState::Failed);
        match self.store.update_status(name, &resource).await {
            Ok(()) => warn!("{} {} marked failed", S::KIND, name),
            Err(e) => warn!("Failed to mark {} {} failed: {}", S::KIND, name, e),
        }
    }

    /// Releases a state lock left by an interrupted attempt
    async fn unlock(&self, name: &str, log: &LogSink) {
        if let Err(e) = self.backend.force_unlock(name).await {
            warn!("Force unlock of {} failed: {}", name, e);
            log.line(format!("force unlock failed: {}", e));
        }
    }

    /// Loads the parent cluster, which must exist and not be going away
    async fn load_parent(&self, spec: &S) -> Result<Option<Cluster>> {
        let (Some(parents), Some(parent)) = (&self.parents, spec.parent()) else {
            return Ok(None);
        };

        let cluster = parents.get(parent).await.map_err(|e| {
            if e.is_not_found() {
                ControlError::NotFound(format!("cluster {}", parent))
            } else {
                e
            }
        })?;

        if matches!(
            cluster.state(),
            LifecycleState::Deleting | LifecycleState::Deleted
        ) {
            return Err(ControlError::Validation(format!(
                "cluster {} is {}",
                parent,
                cluster.state()
            )));
        }

        Ok(Some(cluster))
    }

    /// Adds the resource to its parent's members
    ///
    /// Called once the resource is persisted, and again on resume.
    async fn attach_to_parent(&self, spec: &S) -> Result<()> {
        let Some(parents) = &self.parents else {
            return Ok(());
        };
        let Some(mut cluster) = self.load_parent(spec).await? else {
            return Ok(());
        };

        if cluster.members.insert(spec.name().to_string()) {
            parents.update(cluster.name(), &cluster).await?;
        }
        Ok(())
    }

    /// Best-effort removal from the parent's members
    async fn detach_from_parent(&self, spec: &S, log: &LogSink) {
        let (Some(parents), Some(parent)) = (&self.parents, spec.parent()) else {
            return;
        };

        let result = async {
            let mut cluster = parents.get(parent).await?;
            if cluster.members.remove(spec.name()) {
                parents.update(parent, &cluster).await?;
            }
            Ok::<_, ControlError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(
                "Failed to detach {} {} from cluster {}: {}",
                S::KIND,
                spec.name(),
                parent,
                e
            );
            log.line(format!("detaching from cluster {} failed: {}", parent, e));
        }
    }

    fn working_dir(&self, name: &str) -> PathBuf {
        self.settings.work_dir.join(S::KIND).join(name)
    }

    /// Creates the working directory of `name` if missing
    async fn prepare_working_dir(&self, name: &str) -> anyhow::Result<PathBuf> {
        let dir = self.working_dir(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create working directory {}", dir.display()))?;
        Ok(dir)
    }

    fn env(&self, spec: &S, name: &str) -> BTreeMap<String, String> {
        let mut env = spec.provisioning_env();
        env.insert("TF_WORKSPACE".to_string(), name.to_string());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryStore;
    use crate::testing::ScriptedBackend;
    use async_trait::async_trait;
    use keel_core::domain::{ClusterSpec, Workspace, WorkspaceQuota, WorkspaceSpec};
    use keel_runner::ExecutorConfig;

    /// Workspace store whose inserts always fail
    #[derive(Default)]
    struct RejectingStore(InMemoryStore<Workspace>);

    #[async_trait]
    impl ResourceStore<Workspace> for RejectingStore {
        async fn get(&self, key: &str) -> Result<Workspace> {
            self.0.get(key).await
        }

        async fn list(&self) -> Result<Vec<Workspace>> {
            self.0.list().await
        }

        async fn create(&self, _key: &str, _value: &Workspace) -> Result<()> {
            Err(ControlError::Internal("db down".to_string()))
        }

        async fn update(&self, key: &str, value: &Workspace) -> Result<()> {
            self.0.update(key, value).await
        }

        async fn update_status(&self, key: &str, value: &Workspace) -> Result<()> {
            self.0.update_status(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.0.delete(key).await
        }
    }

    fn work_dir() -> PathBuf {
        std::env::temp_dir().join("keel-lifecycle-tests")
    }

    struct Fixture {
        clusters: Arc<InMemoryStore<Cluster>>,
        workspaces: Arc<InMemoryStore<Workspace>>,
        backend: Arc<ScriptedBackend>,
        cluster_ctl: ClusterController,
        workspace_ctl: WorkspaceController,
    }

    fn settings(max_resources: usize, job_timeout: Duration) -> LifecycleSettings {
        LifecycleSettings {
            max_resources,
            job_timeout,
            work_dir: work_dir(),
        }
    }

    fn fixture_with(backend: ScriptedBackend, max: usize, timeout: Duration) -> Fixture {
        let clusters = Arc::new(InMemoryStore::<Cluster>::new());
        let workspaces = Arc::new(InMemoryStore::<Workspace>::new());
        let backend = Arc::new(backend);
        let config = ExecutorConfig::new(Duration::from_millis(1));

        let cluster_ctl = ClusterController::new(
            clusters.clone(),
            JobExecutor::with_config("cluster", config.clone()),
            backend.clone(),
            settings(max, timeout),
        );
        let workspace_ctl = WorkspaceController::new(
            workspaces.clone(),
            JobExecutor::with_config("workspace", config),
            backend.clone(),
            settings(max, timeout),
        )
        .with_parents(clusters.clone());

        Fixture {
            clusters,
            workspaces,
            backend,
            cluster_ctl,
            workspace_ctl,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ScriptedBackend::new(), 5, Duration::from_secs(5))
    }

    fn cluster(name: &str) -> ClusterSpec {
        ClusterSpec {
            name: name.to_string(),
            region: "eu-west-1".to_string(),
            git_ref: "v1.0.0".to_string(),
            node_count: 3,
        }
    }

    fn workspace(name: &str, cluster: &str) -> WorkspaceSpec {
        WorkspaceSpec {
            name: name.to_string(),
            cluster: cluster.to_string(),
            git_ref: "v1.0.0".to_string(),
            quota: WorkspaceQuota {
                cpu: 8,
                memory_gib: 32,
                gpu: 0,
            },
            image_tag: "2024.1".to_string(),
        }
    }

    /// Waits for the job currently running under `name`, if any
    async fn settle<S: LifecycleSpec>(ctl: &LifecycleController<S>, name: &str) {
        if let Some(job) = ctl.executor().get_job(name) {
            job.wait().await;
        }
    }

    #[tokio::test]
    async fn test_create_provisions_and_marks_ready() {
        let f = fixture();

        f.cluster_ctl.create(cluster("prod-eu")).await.unwrap();
        assert_eq!(
            f.clusters.peek("prod-eu").unwrap().state(),
            LifecycleState::Creating
        );
        settle(&f.cluster_ctl, "prod-eu").await;

        let stored = f.clusters.peek("prod-eu").unwrap();
        assert_eq!(stored.state(), LifecycleState::Ready);
        assert_eq!(stored.status.last_state, LifecycleState::Creating);
        assert_eq!(stored.status.properties[APPLIED_REF], "v1.0.0");

        assert!(f.backend.has_workspace("prod-eu"));
        let dir = work_dir().join("cluster").join("prod-eu");
        assert_eq!(f.backend.calls()[1], format!("apply {}", dir.display()));
        assert!(dir.is_dir());
        let env = f.backend.last_env();
        assert_eq!(env["TF_WORKSPACE"], "prod-eu");
        assert_eq!(env["TF_VAR_region"], "eu-west-1");
        assert_eq!(f.backend.count("force_unlock"), 0);
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected_before_any_change() {
        let f = fixture();

        for name in ["", "Prod", "9lives", "prod_eu", "averyveryverylongname1"] {
            let err = f.cluster_ctl.create(cluster(name)).await.unwrap_err();
            assert!(matches!(err, ControlError::Validation(_)), "{}", name);
        }

        f.clusters.seed("main", Cluster::new(cluster("main"), LifecycleState::Ready));
        let err = f
            .workspace_ctl
            .create(workspace("data-team", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        let mut no_ref = cluster("prod");
        no_ref.git_ref = " ".to_string();
        let err = f.cluster_ctl.create(no_ref).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        assert_eq!(f.clusters.len(), 1);
        assert!(f.workspaces.is_empty());
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let f = fixture_with(ScriptedBackend::new(), 1, Duration::from_secs(5));

        f.cluster_ctl.create(cluster("one")).await.unwrap();
        let err = f.cluster_ctl.create(cluster("two")).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::CapacityExceeded {
                kind: "clusters",
                max: 1
            }
        ));
        assert!(f.clusters.peek("two").is_none());
    }

    #[tokio::test]
    async fn test_create_on_existing_resource() {
        let backend = ScriptedBackend::new().with_apply_delay(Duration::from_millis(200));
        let f = fixture_with(backend, 5, Duration::from_secs(5));

        f.cluster_ctl.create(cluster("prod")).await.unwrap();

        // Creation in flight: the job is already running
        let err = f.cluster_ctl.create(cluster("prod")).await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));

        settle(&f.cluster_ctl, "prod").await;

        // Ready resources are not re-created
        let err = f.cluster_ctl.create(cluster("prod")).await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyExists(_)));
        assert_eq!(f.backend.count("apply"), 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_is_retried_after_unlock() {
        let backend = ScriptedBackend::new().with_apply_codes(&[1, 2]);
        let f = fixture_with(backend, 5, Duration::from_secs(5));

        f.cluster_ctl.create(cluster("prod")).await.unwrap();
        let job = f.cluster_ctl.executor().get_job("prod").unwrap();
        job.wait().await;

        assert_eq!(job.attempts(), 3);
        assert_eq!(f.backend.count("apply"), 3);
        assert_eq!(f.backend.count("force_unlock"), 2);
        assert_eq!(
            f.clusters.peek("prod").unwrap().state(),
            LifecycleState::Ready
        );
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_and_keeps_log() {
        let backend = ScriptedBackend::new().with_apply_exit(1);
        let f = fixture_with(backend, 5, Duration::from_millis(100));

        f.cluster_ctl.create(cluster("prod")).await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        let stored = f.clusters.peek("prod").unwrap();
        assert_eq!(stored.state(), LifecycleState::Failed);
        assert_eq!(stored.status.last_state, LifecycleState::Creating);

        assert!(stored.status.properties[LAST_ERROR].starts_with("Timed out"));

        let log = f.cluster_ctl.job_log("prod").unwrap();
        assert!(log.contains("apply exited with 1"));
        assert!(f.cluster_ctl.executor().get_job("prod").is_none());
    }

    #[tokio::test]
    async fn test_apply_finishing_after_deadline_keeps_failed() {
        let backend = ScriptedBackend::new().with_apply_delay(Duration::from_millis(300));
        let f = fixture_with(backend, 5, Duration::from_millis(100));

        f.cluster_ctl.create(cluster("slow")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            f.clusters.peek("slow").unwrap().state(),
            LifecycleState::Failed
        );

        // The abandoned apply still holds the name
        let err = f.cluster_ctl.update(cluster("slow")).await.unwrap_err();
        assert!(matches!(err, ControlError::AlreadyRunning(_)));

        settle(&f.cluster_ctl, "slow").await;

        let stored = f.clusters.peek("slow").unwrap();
        assert_eq!(stored.state(), LifecycleState::Failed);
        assert!(!stored.status.properties.contains_key(APPLIED_REF));
        assert_eq!(f.backend.count("apply"), 1);
        assert!(
            f.cluster_ctl
                .job_log("slow")
                .unwrap()
                .contains("deadline passed, discarding apply result")
        );

        // Once released, the name accepts a new job
        f.cluster_ctl.update(cluster("slow")).await.unwrap();
        assert!(f.cluster_ctl.executor().get_job("slow").is_some());
    }

    #[tokio::test]
    async fn test_update_changes_only_mutable_fields() {
        let f = fixture();
        f.cluster_ctl.create(cluster("prod")).await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        let mut desired = cluster("prod");
        desired.region = "us-east-1".to_string();
        desired.node_count = 6;
        desired.git_ref = "v1.1.0".to_string();
        f.cluster_ctl.update(desired).await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        let stored = f.clusters.peek("prod").unwrap();
        assert_eq!(stored.spec.region, "eu-west-1");
        assert_eq!(stored.spec.node_count, 6);
        assert_eq!(stored.state(), LifecycleState::Ready);
        assert_eq!(stored.status.last_state, LifecycleState::Updating);
        assert_eq!(stored.status.properties[APPLIED_REF], "v1.1.0");
        assert_eq!(f.backend.count("apply"), 2);
    }

    #[tokio::test]
    async fn test_update_rejections() {
        let f = fixture();

        let err = f.cluster_ctl.update(cluster("ghost")).await.unwrap_err();
        assert!(err.is_not_found());

        f.clusters.seed(
            "leaving",
            Cluster::new(cluster("leaving"), LifecycleState::Deleting),
        );
        let err = f.cluster_ctl.update(cluster("leaving")).await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_of_absent_or_deleted_is_noop() {
        let f = fixture();

        f.workspace_ctl.delete("ws1").await.unwrap();

        f.workspaces.seed(
            "ws2",
            Workspace::new(workspace("ws2", "main"), LifecycleState::Deleted),
        );
        f.workspace_ctl.delete("ws2").await.unwrap();

        assert!(f.workspace_ctl.executor().get_job("ws2").is_none());
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_delete_destroys_then_erases() {
        let f = fixture();
        f.cluster_ctl.create(cluster("prod")).await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        f.cluster_ctl.delete("prod").await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        assert!(f.clusters.peek("prod").is_none());
        assert!(!f.backend.has_workspace("prod"));
        assert_eq!(f.backend.count("destroy"), 1);
        assert!(f.cluster_ctl.get("prod").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_retries_while_remote_workspace_busy() {
        let backend = ScriptedBackend::new().with_busy_workspace(1);
        let f = fixture_with(backend, 5, Duration::from_secs(5));
        f.clusters
            .seed("prod", Cluster::new(cluster("prod"), LifecycleState::Ready));

        f.cluster_ctl.delete("prod").await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        assert!(f.clusters.peek("prod").is_none());
        assert_eq!(f.backend.count("destroy"), 2);
        assert_eq!(f.backend.count("delete_workspace"), 2);
        assert_eq!(f.backend.count("force_unlock"), 1);
    }

    #[tokio::test]
    async fn test_delete_timeout_keeps_record_failed() {
        let backend = ScriptedBackend::new().with_destroy_exit(1);
        let f = fixture_with(backend, 5, Duration::from_millis(100));
        f.clusters
            .seed("prod", Cluster::new(cluster("prod"), LifecycleState::Ready));

        f.cluster_ctl.delete("prod").await.unwrap();
        settle(&f.cluster_ctl, "prod").await;

        let stored = f.clusters.peek("prod").unwrap();
        assert_eq!(stored.state(), LifecycleState::Failed);
        assert_eq!(stored.status.last_state, LifecycleState::Deleting);
    }

    #[tokio::test]
    async fn test_workspace_membership() {
        let f = fixture();

        let err = f
            .workspace_ctl
            .create(workspace("ws1", "main"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        f.cluster_ctl.create(cluster("main")).await.unwrap();
        settle(&f.cluster_ctl, "main").await;

        f.workspace_ctl
            .create(workspace("ws1", "main"))
            .await
            .unwrap();
        settle(&f.workspace_ctl, "ws1").await;
        assert!(f.clusters.peek("main").unwrap().members.contains("ws1"));
        assert_eq!(
            f.workspaces.peek("ws1").unwrap().state(),
            LifecycleState::Ready
        );

        let err = f.cluster_ctl.delete("main").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));

        f.workspace_ctl.delete("ws1").await.unwrap();
        settle(&f.workspace_ctl, "ws1").await;
        assert!(f.clusters.peek("main").unwrap().members.is_empty());

        f.cluster_ctl.delete("main").await.unwrap();
        settle(&f.cluster_ctl, "main").await;
        assert!(f.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_insert_leaves_parent_untouched() {
        let clusters = Arc::new(InMemoryStore::<Cluster>::new());
        clusters.seed("main", Cluster::new(cluster("main"), LifecycleState::Ready));
        let backend = Arc::new(ScriptedBackend::new());
        let config = ExecutorConfig::new(Duration::from_millis(1));

        let workspace_ctl = WorkspaceController::new(
            Arc::new(RejectingStore::default()),
            JobExecutor::with_config("workspace", config.clone()),
            backend.clone(),
            settings(5, Duration::from_secs(5)),
        )
        .with_parents(clusters.clone());
        let cluster_ctl = ClusterController::new(
            clusters.clone(),
            JobExecutor::with_config("cluster", config),
            backend.clone(),
            settings(5, Duration::from_secs(5)),
        );

        let err = workspace_ctl
            .create(workspace("ws1", "main"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Internal(ref msg) if msg == "db down"));
        assert!(clusters.peek("main").unwrap().members.is_empty());
        assert!(backend.calls().is_empty());

        cluster_ctl.delete("main").await.unwrap();
        settle(&cluster_ctl, "main").await;
        assert!(clusters.is_empty());
    }

    #[tokio::test]
    async fn test_resumed_creation_restores_membership() {
        let f = fixture();
        f.clusters
            .seed("main", Cluster::new(cluster("main"), LifecycleState::Ready));
        f.workspaces.seed(
            "ws1",
            Workspace::new(workspace("ws1", "main"), LifecycleState::Creating),
        );

        assert_eq!(f.workspace_ctl.recover().await.unwrap(), 1);
        settle(&f.workspace_ctl, "ws1").await;

        assert!(f.clusters.peek("main").unwrap().members.contains("ws1"));
        assert_eq!(
            f.workspaces.peek("ws1").unwrap().state(),
            LifecycleState::Ready
        );
    }

    #[tokio::test]
    async fn test_missing_parent_does_not_block_delete() {
        let f = fixture();
        f.workspaces.seed(
            "orphan",
            Workspace::new(workspace("orphan", "gone"), LifecycleState::Ready),
        );

        f.workspace_ctl.delete("orphan").await.unwrap();
        let job = f.workspace_ctl.executor().get_job("orphan").unwrap();
        job.wait().await;

        assert!(f.workspaces.is_empty());
        assert!(job.get_log().contains("detaching from cluster gone failed"));
    }

    #[tokio::test]
    async fn test_recovery_resumes_in_flight_resources() {
        let f = fixture();
        f.clusters
            .seed("fresh", Cluster::new(cluster("fresh"), LifecycleState::Creating));
        f.clusters
            .seed("stable", Cluster::new(cluster("stable"), LifecycleState::Ready));
        f.clusters
            .seed("old", Cluster::new(cluster("old"), LifecycleState::Deleting));
        let mut updating = Cluster::new(cluster("grow"), LifecycleState::Updating);
        updating.spec.node_count = 9;
        f.clusters.seed("grow", updating);

        let resumed = f.cluster_ctl.recover().await.unwrap();
        assert_eq!(resumed, 3);

        for name in ["fresh", "old", "grow"] {
            settle(&f.cluster_ctl, name).await;
        }

        assert_eq!(
            f.clusters.peek("fresh").unwrap().state(),
            LifecycleState::Ready
        );
        assert_eq!(f.clusters.peek("grow").unwrap().spec.node_count, 9);
        assert_eq!(
            f.clusters.peek("grow").unwrap().state(),
            LifecycleState::Ready
        );
        assert!(f.clusters.peek("old").is_none());
        assert_eq!(
            f.clusters.peek("stable").unwrap().state(),
            LifecycleState::Ready
        );

        assert_eq!(f.backend.count("create_workspace"), 1);
        assert_eq!(f.backend.count("apply"), 2);
        assert_eq!(f.backend.count("destroy"), 1);
    }
}
