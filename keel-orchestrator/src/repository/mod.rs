//! Repository Module
//!
//! Data access layer for the orchestrator.
//! `ResourceStore` is the narrow interface to the durable store; the
//! in-memory and Postgres implementations live in their own modules.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use keel_core::Result;
use keel_core::domain::{Cluster, Workload, Workspace};
use sqlx::PgPool;
use std::sync::Arc;

pub use memory::InMemoryStore;
pub use postgres::PgResourceStore;

/// Keyed persistence for one kind of object
///
/// Writes are last-write-wins; no optimistic concurrency is enforced.
#[async_trait]
pub trait ResourceStore<T>: Send + Sync
where
    T: Send + Sync,
{
    /// Fetches an object, failing with `NotFound` if absent
    async fn get(&self, key: &str) -> Result<T>;

    /// Lists all objects ordered by key
    async fn list(&self) -> Result<Vec<T>>;

    /// Inserts a new object, failing with `AlreadyExists` if present
    async fn create(&self, key: &str, value: &T) -> Result<()>;

    /// Replaces an existing object, failing with `NotFound` if absent
    async fn update(&self, key: &str, value: &T) -> Result<()>;

    /// Persists an object's status
    ///
    /// Stores without a separate status channel replace the whole object.
    async fn update_status(&self, key: &str, value: &T) -> Result<()>;

    /// Removes an object, failing with `NotFound` if absent
    async fn delete(&self, key: &str) -> Result<()>;
}

/// The stores used by the control plane
#[derive(Clone)]
pub struct Stores {
    pub clusters: Arc<dyn ResourceStore<Cluster>>,
    pub workspaces: Arc<dyn ResourceStore<Workspace>>,
    pub workloads: Arc<dyn ResourceStore<Workload>>,
}

impl Stores {
    /// Stores held in process memory, lost on restart
    pub fn in_memory() -> Self {
        Self {
            clusters: Arc::new(InMemoryStore::<Cluster>::new()),
            workspaces: Arc::new(InMemoryStore::<Workspace>::new()),
            workloads: Arc::new(InMemoryStore::<Workload>::new()),
        }
    }

    /// Stores backed by Postgres tables
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            clusters: Arc::new(PgResourceStore::<Cluster>::new(
                pool.clone(),
                postgres::CLUSTERS_TABLE,
            )),
            workspaces: Arc::new(PgResourceStore::<Workspace>::new(
                pool.clone(),
                postgres::WORKSPACES_TABLE,
            )),
            workloads: Arc::new(PgResourceStore::<Workload>::new(
                pool,
                postgres::WORKLOADS_TABLE,
            )),
        }
    }
}
