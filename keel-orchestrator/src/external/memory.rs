//! In-memory external API
//!
//! Keeps derived objects in a map. Used for development runs without a
//! cluster and by tests, which can also inject failures and set replica
//! readiness.

use async_trait::async_trait;
use keel_core::domain::ResourceKey;
use keel_core::{ControlError, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::{DerivedObject, ExternalApiClient, ObjectKind};

/// In-memory implementation of ExternalApiClient
#[derive(Default)]
pub struct InMemoryApiClient {
    objects: Mutex<BTreeMap<(ObjectKind, ResourceKey), DerivedObject>>,
    calls: Mutex<Vec<String>>,
    failures: AtomicU32,
    ready_on_apply: AtomicBool,
}

impl InMemoryApiClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports every replica of a deployment ready as soon as it is written
    pub fn with_ready_on_apply(self) -> Self {
        self.ready_on_apply.store(true, Ordering::SeqCst);
        self
    }

    /// Makes the next `count` calls fail with an internal error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Sets the ready replica count reported for a deployment
    pub fn set_ready_replicas(&self, key: &ResourceKey, ready: i32) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(object) = objects.get_mut(&(ObjectKind::Deployment, key.clone())) {
            object.status = serde_json::json!({ "readyReplicas": ready });
        }
    }

    pub fn object(&self, kind: ObjectKind, key: &ResourceKey) -> Option<DerivedObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind, key.clone()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Recorded calls, e.g. `create Deployment team/nb`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, kind: ObjectKind, key: &ResourceKey) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {} {}", op, kind, key));

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ControlError::Internal(format!(
                "injected failure on {} {} {}",
                op, kind, key
            )));
        }
        Ok(())
    }

    fn status_for(&self, object: &DerivedObject) -> serde_json::Value {
        if object.kind == ObjectKind::Deployment && self.ready_on_apply.load(Ordering::SeqCst) {
            let replicas = object.spec.get("replicas").cloned().unwrap_or_default();
            return serde_json::json!({ "readyReplicas": replicas });
        }
        object.status.clone()
    }
}

#[async_trait]
impl ExternalApiClient for InMemoryApiClient {
    async fn get(&self, kind: ObjectKind, key: &ResourceKey) -> Result<Option<DerivedObject>> {
        self.record("get", kind, key)?;
        Ok(self.object(kind, key))
    }

    async fn create(&self, object: &DerivedObject) -> Result<()> {
        self.record("create", object.kind, &object.key)?;

        let mut stored = object.clone();
        stored.status = self.status_for(object);

        let mut objects = self.objects.lock().unwrap();
        let slot = (object.kind, object.key.clone());
        if objects.contains_key(&slot) {
            return Err(ControlError::AlreadyExists(object.key.to_string()));
        }
        objects.insert(slot, stored);
        Ok(())
    }

    async fn update(&self, object: &DerivedObject) -> Result<()> {
        self.record("update", object.kind, &object.key)?;

        let status = self.status_for(object);
        let mut objects = self.objects.lock().unwrap();
        match objects.get_mut(&(object.kind, object.key.clone())) {
            Some(existing) => {
                existing.spec = object.spec.clone();
                if !status.is_null() {
                    existing.status = status;
                }
                Ok(())
            }
            None => Err(ControlError::NotFound(object.key.to_string())),
        }
    }

    async fn delete(&self, kind: ObjectKind, key: &ResourceKey) -> Result<()> {
        self.record("delete", kind, key)?;

        match self.objects.lock().unwrap().remove(&(kind, key.clone())) {
            Some(_) => Ok(()),
            None => Err(ControlError::NotFound(key.to_string())),
        }
    }
}
