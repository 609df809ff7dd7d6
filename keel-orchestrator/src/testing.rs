//! Test doubles shared by the orchestrator's unit tests

use async_trait::async_trait;
use keel_core::{ControlError, Result};
use keel_runner::LogSink;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use crate::external::ProvisioningBackend;

/// Provisioning backend with scripted exit codes and recorded calls
#[derive(Default)]
pub struct ScriptedBackend {
    apply_codes: Mutex<VecDeque<i32>>,
    apply_fallback: AtomicI32,
    destroy_fallback: AtomicI32,
    apply_delay: Mutex<Duration>,
    busy_replies: AtomicU32,
    workspaces: Mutex<BTreeSet<String>>,
    calls: Mutex<Vec<String>>,
    last_env: Mutex<BTreeMap<String, String>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit codes returned by successive applies, then success
    pub fn with_apply_codes(self, codes: &[i32]) -> Self {
        self.apply_codes.lock().unwrap().extend(codes);
        self
    }

    /// Every apply exits with `code`
    pub fn with_apply_exit(self, code: i32) -> Self {
        self.apply_fallback.store(code, Ordering::SeqCst);
        self
    }

    pub fn with_destroy_exit(self, code: i32) -> Self {
        self.destroy_fallback.store(code, Ordering::SeqCst);
        self
    }

    /// Each apply sleeps this long before exiting
    pub fn with_apply_delay(self, delay: Duration) -> Self {
        *self.apply_delay.lock().unwrap() = delay;
        self
    }

    /// The next `count` empty-checks report the remote workspace as in use
    pub fn with_busy_workspace(self, count: u32) -> Self {
        self.busy_replies.store(count, Ordering::SeqCst);
        self
    }

    /// Number of recorded calls of one operation
    pub fn count(&self, op: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(' ').next() == Some(op))
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Environment of the most recent apply or destroy
    pub fn last_env(&self) -> BTreeMap<String, String> {
        self.last_env.lock().unwrap().clone()
    }

    pub fn has_workspace(&self, name: &str) -> bool {
        self.workspaces.lock().unwrap().contains(name)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    async fn create_workspace(&self, name: &str) -> Result<()> {
        self.record(format!("create_workspace {}", name));
        if !self.workspaces.lock().unwrap().insert(name.to_string()) {
            return Err(ControlError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    async fn delete_workspace_if_empty(&self, name: &str) -> Result<bool> {
        self.record(format!("delete_workspace {}", name));
        let busy = self
            .busy_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if busy {
            return Ok(false);
        }
        self.workspaces.lock().unwrap().remove(name);
        Ok(true)
    }

    async fn force_unlock(&self, name: &str) -> Result<()> {
        self.record(format!("force_unlock {}", name));
        Ok(())
    }

    async fn apply(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32> {
        self.record(format!("apply {}", working_dir.display()));
        *self.last_env.lock().unwrap() = env.clone();

        let delay = *self.apply_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let code = self
            .apply_codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.apply_fallback.load(Ordering::SeqCst));
        log.line(format!("apply exited with {}", code));
        Ok(code)
    }

    async fn destroy(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32> {
        self.record(format!("destroy {}", working_dir.display()));
        *self.last_env.lock().unwrap() = env.clone();

        let code = self.destroy_fallback.load(Ordering::SeqCst);
        log.line(format!("destroy exited with {}", code));
        Ok(code)
    }
}
