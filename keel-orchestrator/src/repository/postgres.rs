//! Postgres store
//!
//! Persists each object as a JSONB document keyed by name, one table per
//! kind. Tables are created by `db::run_migrations`.

use async_trait::async_trait;
use keel_core::{ControlError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::marker::PhantomData;

use super::ResourceStore;

pub const CLUSTERS_TABLE: &str = "keel_clusters";
pub const WORKSPACES_TABLE: &str = "keel_workspaces";
pub const WORKLOADS_TABLE: &str = "keel_workloads";

/// Tables managed by this store
pub const TABLES: [&str; 3] = [CLUSTERS_TABLE, WORKSPACES_TABLE, WORKLOADS_TABLE];

/// Postgres implementation of ResourceStore
pub struct PgResourceStore<T> {
    pool: PgPool,
    table: &'static str,
    get_sql: String,
    list_sql: String,
    insert_sql: String,
    update_sql: String,
    delete_sql: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PgResourceStore<T> {
    /// Creates a store over `table`, which must be one of [`TABLES`]
    pub fn new(pool: PgPool, table: &'static str) -> Self {
        Self {
            pool,
            table,
            get_sql: format!("SELECT body FROM {} WHERE name = $1", table),
            list_sql: format!("SELECT body FROM {} ORDER BY name ASC", table),
            insert_sql: format!(
                "INSERT INTO {} (name, body, updated_at) VALUES ($1, $2, NOW()) ON CONFLICT (name) DO NOTHING",
                table
            ),
            update_sql: format!(
                "UPDATE {} SET body = $2, updated_at = NOW() WHERE name = $1",
                table
            ),
            delete_sql: format!("DELETE FROM {} WHERE name = $1", table),
            _marker: PhantomData,
        }
    }

    fn db_error(&self, err: sqlx::Error) -> ControlError {
        tracing::error!("Database error on {}: {:?}", self.table, err);
        ControlError::internal(err)
    }
}

#[async_trait]
impl<T> ResourceStore<T> for PgResourceStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<T> {
        let body = sqlx::query_scalar::<_, serde_json::Value>(&self.get_sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?
            .ok_or_else(|| ControlError::NotFound(key.to_string()))?;

        Ok(serde_json::from_value(body)?)
    }

    async fn list(&self) -> Result<Vec<T>> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(&self.list_sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        rows.into_iter()
            .map(|body| serde_json::from_value(body).map_err(ControlError::from))
            .collect()
    }

    async fn create(&self, key: &str, value: &T) -> Result<()> {
        let result = sqlx::query(&self.insert_sql)
            .bind(key)
            .bind(serde_json::to_value(value)?)
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        if result.rows_affected() == 0 {
            return Err(ControlError::AlreadyExists(key.to_string()));
        }
        Ok(())
    }

    async fn update(&self, key: &str, value: &T) -> Result<()> {
        let result = sqlx::query(&self.update_sql)
            .bind(key)
            .bind(serde_json::to_value(value)?)
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(key.to_string()));
        }
        Ok(())
    }

    async fn update_status(&self, key: &str, value: &T) -> Result<()> {
        self.update(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let result = sqlx::query(&self.delete_sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| self.db_error(e))?;

        if result.rows_affected() == 0 {
            return Err(ControlError::NotFound(key.to_string()));
        }
        Ok(())
    }
}
