//! Connection pool and schema

use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

/// Creates the jobs table and its indexes if they do not exist yet
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            seq BIGSERIAL NOT NULL,
            owner_id VARCHAR(255) NOT NULL,
            parent_id UUID,
            kind VARCHAR(255) NOT NULL,
            payload JSONB NOT NULL DEFAULT 'null',
            status VARCHAR(50) NOT NULL,
            priority SMALLINT NOT NULL,
            progress_percent DOUBLE PRECISION NOT NULL DEFAULT 0,
            progress_message TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            heartbeat_at TIMESTAMPTZ,
            timeout_seconds BIGINT NOT NULL,
            retry_on_timeout BOOLEAN NOT NULL DEFAULT TRUE,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            worker_id VARCHAR(255),
            error_code VARCHAR(50),
            error_message TEXT,
            error_details JSONB,
            result_ref JSONB,
            version BIGINT NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Tables created before heartbeats existed
    sqlx::query("ALTER TABLE jobs ADD COLUMN IF NOT EXISTS heartbeat_at TIMESTAMPTZ")
        .execute(pool)
        .await?;

    // Dequeue order: priority band first, then arrival
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_pending ON jobs(priority DESC, created_at, seq) WHERE status = 'Pending'",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
