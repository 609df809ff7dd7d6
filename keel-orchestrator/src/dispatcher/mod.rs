//! Resource dispatcher
//!
//! Runs one processing loop per resource key. Each loop owns a bounded
//! signal queue; bursts of notifications are coalesced into a single
//! reconciliation pass. Failed passes are retried by a delayed re-signal
//! instead of inline, so the loop stays responsive.
//!
//! A key's queue is torn down after a finalizing pass, once every pending
//! delayed retry for the key has fired. Retries send straight into the
//! queue, so the pending counter acts as the barrier that keeps the queue
//! alive until the last sender is done.

pub mod reconciler;
pub mod workload;

use keel_core::domain::ResourceKey;
use keel_core::metrics::MetricsSink;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use reconciler::{ReconcileOutcome, Reconciler};
pub use workload::WorkloadReconciler;

/// Dispatcher pacing and limits
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of each key's signal queue
    pub queue_capacity: usize,

    /// Delay before a failed pass is retried
    pub retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            retry_delay: Duration::from_secs(10),
        }
    }
}

/// Per-key queue shared by notifiers, retry emitters and the key's loop
struct KeyQueue {
    tx: mpsc::Sender<()>,

    /// Number of delayed retries that have not fired yet
    pending_retries: watch::Sender<usize>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    reconciler: Arc<dyn Reconciler>,
    metrics: Arc<dyn MetricsSink>,
    queues: Mutex<HashMap<ResourceKey, Arc<KeyQueue>>>,
    shutdown: CancellationToken,
    passes: AtomicU64,
}

/// Coalescing per-key reconciliation dispatcher
#[derive(Clone)]
pub struct ResourceDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ResourceDispatcher {
    /// Creates a new dispatcher
    ///
    /// # Arguments
    /// * `config` - Queue capacity and retry delay
    /// * `reconciler` - Performs each reconciliation pass
    /// * `metrics` - Receives pass counts
    pub fn new(
        config: DispatcherConfig,
        reconciler: Arc<dyn Reconciler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                reconciler,
                metrics,
                queues: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                passes: AtomicU64::new(0),
            }),
        }
    }

    /// Signals that `key` may need reconciliation
    ///
    /// Never blocks. Starts the key's loop if none is running; a full queue
    /// already guarantees a pending pass, so extra signals are dropped.
    pub fn notify(&self, key: &ResourceKey) {
        if self.inner.shutdown.is_cancelled() {
            debug!("Dispatcher stopped, ignoring signal for {}", key);
            return;
        }

        let mut queues = self.inner.queues.lock().unwrap();
        let queue = match queues.get(key) {
            Some(queue) => Arc::clone(queue),
            None => {
                let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);
                let (pending_retries, _) = watch::channel(0usize);
                let queue = Arc::new(KeyQueue {
                    tx,
                    pending_retries,
                });
                queues.insert(key.clone(), Arc::clone(&queue));

                debug!("Starting reconcile loop for {}", key);
                tokio::spawn(run_loop(
                    Arc::clone(&self.inner),
                    key.clone(),
                    Arc::clone(&queue),
                    rx,
                ));
                queue
            }
        };

        match queue.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                debug!("Signal queue for {} full, pass already pending", key);
            }
            Err(TrySendError::Closed(())) => {
                warn!("Signal queue for {} closed unexpectedly", key);
            }
        }
    }

    /// Keys with an active processing loop
    pub fn active_keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.inner.queues.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total number of reconciliation passes run
    pub fn pass_count(&self) -> u64 {
        self.inner.passes.load(Ordering::SeqCst)
    }

    /// Stops every loop and pending delayed retry
    pub fn shutdown(&self) {
        info!("Stopping resource dispatcher");
        self.inner.shutdown.cancel();
        self.inner.queues.lock().unwrap().clear();
    }
}

/// Processing loop for a single key: Idle → Draining → Reconciling → Idle
async fn run_loop(
    inner: Arc<DispatcherInner>,
    key: ResourceKey,
    queue: Arc<KeyQueue>,
    mut rx: mpsc::Receiver<()>,
) {
    let mut signalled = false;

    loop {
        if !signalled {
            tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                signal = rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                }
            }
        }
        signalled = false;

        // Coalesce the burst into this pass
        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Coalesced {} extra signal(s) for {}", coalesced, key);
        }

        let result = inner.reconciler.reconcile(&key).await;
        inner.passes.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(ReconcileOutcome::Applied) => {
                inner.metrics.reconcile_pass(&key.to_string(), true);
            }
            Ok(ReconcileOutcome::Finalized) => {
                inner.metrics.reconcile_pass(&key.to_string(), true);
                if teardown(&inner, &key, &queue, &mut rx).await {
                    debug!("Reconcile loop for {} finished", key);
                    return;
                }
                signalled = true;
            }
            Err(e) => {
                inner.metrics.reconcile_pass(&key.to_string(), false);
                warn!(
                    "Reconcile of {} failed, retrying in {:?}: {:#}",
                    key, inner.config.retry_delay, e
                );
                schedule_retry(&inner, &key, &queue);
            }
        }
    }
}

/// Removes the key's queue once no delayed retry can still send into it
///
/// Returns false if new signals arrived meanwhile; the loop then keeps
/// serving the key.
async fn teardown(
    inner: &DispatcherInner,
    key: &ResourceKey,
    queue: &Arc<KeyQueue>,
    rx: &mut mpsc::Receiver<()>,
) -> bool {
    let pending = queue.pending_retries.subscribe();
    tokio::select! {
        _ = inner.shutdown.cancelled() => return true,
        _ = retries_drained(pending) => {}
    }

    let mut queues = inner.queues.lock().unwrap();
    if rx.try_recv().is_ok() {
        return false;
    }

    let is_current = queues
        .get(key)
        .is_some_and(|current| Arc::ptr_eq(current, queue));
    if is_current {
        queues.remove(key);
    }
    true
}

async fn retries_drained(mut pending: watch::Receiver<usize>) -> bool {
    pending.wait_for(|count| *count == 0).await.is_ok()
}

/// Re-signals `key` after the retry delay without blocking its loop
fn schedule_retry(inner: &DispatcherInner, key: &ResourceKey, queue: &Arc<KeyQueue>) {
    queue.pending_retries.send_modify(|count| *count += 1);

    let queue = Arc::clone(queue);
    let key = key.clone();
    let delay = inner.config.retry_delay;
    let shutdown = inner.shutdown.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = tokio::time::sleep(delay) => {
                debug!("Retrying reconcile of {}", key);
                let _ = queue.tx.try_send(());
            }
        }
        queue.pending_retries.send_modify(|count| *count -= 1);
    });
}
