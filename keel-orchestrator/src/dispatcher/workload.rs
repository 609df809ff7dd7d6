//! Workload reconciler
//!
//! Keeps the derived sub-objects of a watched workload (deployment,
//! service, route rules, volume claim) in line with its spec, maintains
//! the control-plane finalizer and records the derived readiness state.

use anyhow::Context;
use async_trait::async_trait;
use keel_core::domain::{ResourceKey, Workload, transition_state};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

use super::reconciler::{ReconcileOutcome, Reconciler};
use crate::external::{DerivedObject, ExternalApiClient, ObjectKind};
use crate::repository::ResourceStore;

/// Order in which derived objects are released on finalization
const RELEASE_ORDER: [ObjectKind; 4] = [
    ObjectKind::RouteRules,
    ObjectKind::Service,
    ObjectKind::Deployment,
    ObjectKind::VolumeClaim,
];

/// Reconciler for watched workloads
pub struct WorkloadReconciler {
    store: Arc<dyn ResourceStore<Workload>>,
    api: Arc<dyn ExternalApiClient>,
}

impl WorkloadReconciler {
    pub fn new(store: Arc<dyn ResourceStore<Workload>>, api: Arc<dyn ExternalApiClient>) -> Self {
        Self { store, api }
    }

    /// Fetches the workload, mapping a missing object to `None`
    async fn fetch(&self, key: &ResourceKey) -> anyhow::Result<Option<Workload>> {
        match self.store.get(&key.to_string()).await {
            Ok(workload) => Ok(Some(workload)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to fetch workload {}", key)),
        }
    }

    /// Recomputes the readiness state and persists it if it changed
    async fn refresh_status(&self, workload: &mut Workload) -> anyhow::Result<()> {
        let key = workload.key();
        let ready = self
            .api
            .get(ObjectKind::Deployment, &key)
            .await
            .with_context(|| format!("Failed to read deployment for {}", key))?
            .map(|deployment| deployment.ready_replicas())
            .unwrap_or(0);

        let state = transition_state(workload.spec.replicas, ready, workload.status.state);
        if state == workload.status.state && ready == workload.status.ready_replicas {
            return Ok(());
        }

        debug!("Workload {} is {} ({} ready)", key, state, ready);
        workload.status.state = state;
        workload.status.ready_replicas = ready;
        workload.status.updated_at = Some(chrono::Utc::now());
        self.store
            .update_status(&key.to_string(), workload)
            .await
            .with_context(|| format!("Failed to persist status of {}", key))?;
        Ok(())
    }

    /// Releases every derived object, then lets the workload go
    async fn finalize(&self, key: &ResourceKey, workload: Option<Workload>) -> anyhow::Result<()> {
        for kind in RELEASE_ORDER {
            match self.api.delete(kind, key).await {
                Ok(()) => debug!("Released {} {}", kind, key),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to release {} {}", kind, key));
                }
            }
        }

        let Some(mut workload) = workload else {
            return Ok(());
        };

        if workload.remove_finalizer() {
            self.store
                .update(&key.to_string(), &workload)
                .await
                .with_context(|| format!("Failed to remove finalizer from {}", key))?;
        }

        // The owner completes the deletion once no finalizers remain
        if workload.metadata.finalizers.is_empty() {
            match self.store.delete(&key.to_string()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e).with_context(|| format!("Failed to delete {}", key)),
            }
        }

        info!("Workload {} finalized", key);
        Ok(())
    }

    /// Creates or updates one derived object
    async fn apply(&self, object: DerivedObject) -> anyhow::Result<()> {
        let existing = self
            .api
            .get(object.kind, &object.key)
            .await
            .with_context(|| format!("Failed to read {} {}", object.kind, object.key))?;

        match existing {
            None => {
                debug!("Creating {} {}", object.kind, object.key);
                self.api
                    .create(&object)
                    .await
                    .with_context(|| format!("Failed to create {} {}", object.kind, object.key))?;
            }
            Some(current) if current.spec != object.spec => {
                debug!("Updating {} {}", object.kind, object.key);
                self.api
                    .update(&object)
                    .await
                    .with_context(|| format!("Failed to update {} {}", object.kind, object.key))?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Volume claims are immutable once created
    async fn ensure_volume(&self, object: DerivedObject) -> anyhow::Result<()> {
        match self.api.create(&object).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to create volume for {}", object.key)),
        }
    }
}

/// Desired derived objects for a workload
fn desired_objects(workload: &Workload) -> Vec<DerivedObject> {
    let key = workload.key();
    let spec = &workload.spec;
    let labels = json!({ "app": key.name });

    let mut objects = vec![
        DerivedObject::new(
            ObjectKind::Deployment,
            key.clone(),
            json!({
                "replicas": spec.replicas,
                "selector": labels,
                "image": spec.image,
                "port": spec.port,
                "volume": spec.storage_gib.map(|_| key.name.clone()),
            }),
        ),
        DerivedObject::new(
            ObjectKind::Service,
            key.clone(),
            json!({ "selector": labels, "port": spec.port }),
        ),
    ];

    if let Some(host) = &spec.host {
        objects.push(DerivedObject::new(
            ObjectKind::RouteRules,
            key.clone(),
            json!({
                "host": host,
                "backend": { "service": key.name, "port": spec.port },
            }),
        ));
    }

    objects
}

fn desired_volume(workload: &Workload) -> Option<DerivedObject> {
    workload.spec.storage_gib.map(|size| {
        DerivedObject::new(
            ObjectKind::VolumeClaim,
            workload.key(),
            json!({ "storage": format!("{}Gi", size) }),
        )
    })
}

#[async_trait]
impl Reconciler for WorkloadReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> anyhow::Result<ReconcileOutcome> {
        let mut workload = self.fetch(key).await?;

        if let Some(current) = workload.as_mut() {
            if !current.is_deleting() && current.add_finalizer() {
                debug!("Adding finalizer to {}", key);
                self.store
                    .update(&key.to_string(), current)
                    .await
                    .with_context(|| format!("Failed to add finalizer to {}", key))?;
            }
            self.refresh_status(current).await?;
        }

        let workload = match workload {
            Some(workload) if !workload.is_deleting() => workload,
            gone => {
                self.finalize(key, gone).await?;
                return Ok(ReconcileOutcome::Finalized);
            }
        };

        if let Some(volume) = desired_volume(&workload) {
            self.ensure_volume(volume).await?;
        }
        for object in desired_objects(&workload) {
            self.apply(object).await?;
        }

        Ok(ReconcileOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InMemoryApiClient;
    use crate::repository::InMemoryStore;
    use keel_core::domain::{FINALIZER, ObjectMeta, ReadinessState, WorkloadSpec, WorkloadStatus};

    fn workload(host: Option<&str>, storage: Option<u32>) -> Workload {
        Workload {
            metadata: ObjectMeta {
                name: "nb".to_string(),
                namespace: "team".to_string(),
                ..Default::default()
            },
            spec: WorkloadSpec {
                image: "jupyter:4.1".to_string(),
                replicas: 1,
                port: 8888,
                host: host.map(str::to_string),
                storage_gib: storage,
            },
            status: WorkloadStatus::default(),
        }
    }

    fn setup(
        seed: Option<Workload>,
    ) -> (
        Arc<InMemoryStore<Workload>>,
        Arc<InMemoryApiClient>,
        WorkloadReconciler,
    ) {
        let store = Arc::new(InMemoryStore::new());
        if let Some(workload) = seed {
            store.seed(&workload.key().to_string(), workload);
        }
        let api = Arc::new(InMemoryApiClient::new());
        let reconciler = WorkloadReconciler::new(store.clone(), api.clone());
        (store, api, reconciler)
    }

    fn key() -> ResourceKey {
        ResourceKey::new("team", "nb")
    }

    #[tokio::test]
    async fn test_creates_derived_objects_and_finalizer() {
        let (store, api, reconciler) = setup(Some(workload(Some("nb.example.com"), Some(10))));

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Applied);

        let stored = store.peek("team/nb").unwrap();
        assert_eq!(stored.metadata.finalizers, vec![FINALIZER.to_string()]);
        assert_eq!(stored.status.state, ReadinessState::Starting);

        for kind in [
            ObjectKind::Deployment,
            ObjectKind::Service,
            ObjectKind::RouteRules,
            ObjectKind::VolumeClaim,
        ] {
            assert!(api.object(kind, &key()).is_some(), "missing {}", kind);
        }
        let deployment = api.object(ObjectKind::Deployment, &key()).unwrap();
        assert_eq!(deployment.spec["image"], "jupyter:4.1");
        assert_eq!(deployment.spec["volume"], "nb");
    }

    #[tokio::test]
    async fn test_unchanged_spec_is_not_rewritten() {
        let (_store, api, reconciler) = setup(Some(workload(None, None)));

        reconciler.reconcile(&key()).await.unwrap();
        reconciler.reconcile(&key()).await.unwrap();

        let updates = api
            .calls()
            .iter()
            .filter(|call| call.starts_with("update"))
            .count();
        assert_eq!(updates, 0);
        assert_eq!(api.object_count(), 2);
    }

    #[tokio::test]
    async fn test_spec_change_updates_deployment() {
        let (store, api, reconciler) = setup(Some(workload(None, None)));
        reconciler.reconcile(&key()).await.unwrap();

        let mut changed = store.peek("team/nb").unwrap();
        changed.spec.image = "jupyter:4.2".to_string();
        store.seed("team/nb", changed);
        reconciler.reconcile(&key()).await.unwrap();

        let deployment = api.object(ObjectKind::Deployment, &key()).unwrap();
        assert_eq!(deployment.spec["image"], "jupyter:4.2");
        assert!(api.calls().contains(&"update Deployment team/nb".to_string()));
    }

    #[tokio::test]
    async fn test_readiness_follows_replicas() {
        let (store, api, reconciler) = setup(Some(workload(None, None)));
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(
            store.peek("team/nb").unwrap().status.state,
            ReadinessState::Starting
        );

        api.set_ready_replicas(&key(), 1);
        reconciler.reconcile(&key()).await.unwrap();
        let status = store.peek("team/nb").unwrap().status;
        assert_eq!(status.state, ReadinessState::Running);
        assert_eq!(status.ready_replicas, 1);

        api.set_ready_replicas(&key(), 0);
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(
            store.peek("team/nb").unwrap().status.state,
            ReadinessState::NotReady
        );
    }

    #[tokio::test]
    async fn test_deletion_releases_objects_and_record() {
        let (store, api, reconciler) = setup(Some(workload(Some("nb.example.com"), Some(5))));
        reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(api.object_count(), 4);

        let mut deleting = store.peek("team/nb").unwrap();
        deleting.metadata.deletion_requested = true;
        store.seed("team/nb", deleting);

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Finalized);
        assert_eq!(api.object_count(), 0);
        assert!(store.peek("team/nb").is_none());
    }

    #[tokio::test]
    async fn test_foreign_finalizer_keeps_record() {
        let mut deleting = workload(None, None);
        deleting.metadata.finalizers = vec![FINALIZER.to_string(), "other/guard".to_string()];
        deleting.metadata.deletion_requested = true;
        let (store, _api, reconciler) = setup(Some(deleting));

        reconciler.reconcile(&key()).await.unwrap();

        let stored = store.peek("team/nb").unwrap();
        assert_eq!(stored.metadata.finalizers, vec!["other/guard".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_workload_is_finalized() {
        let (_store, api, reconciler) = setup(None);

        let outcome = reconciler.reconcile(&key()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Finalized);
        assert!(api.calls().iter().all(|call| call.starts_with("delete")));
    }

    #[tokio::test]
    async fn test_api_failure_surfaces_as_error() {
        let (_store, api, reconciler) = setup(Some(workload(None, None)));
        api.fail_next(1);

        assert!(reconciler.reconcile(&key()).await.is_err());
        assert!(reconciler.reconcile(&key()).await.is_ok());
    }
}
