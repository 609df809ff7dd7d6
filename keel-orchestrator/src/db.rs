use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

use crate::repository::postgres::TABLES;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // One document table per resource kind
    for table in TABLES {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name VARCHAR(255) PRIMARY KEY,
                body JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_state ON {} ((body->'status'->>'state'))",
            table, table
        ))
        .execute(pool)
        .await?;
    }

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
