//! Postgres Job Store
//!
//! Handles all database operations related to jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{
    ErrorCode, Job, JobFailure, JobStatus, Priority, WorkSpec,
};
use conveyor_core::dto::job::OwnerJobsQuery;
use conveyor_core::dto::stats::{JobStatistics, failure_rate};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use super::{JobStore, cutoff, orphan_message};
use crate::error::{Result, StoreError};

const JOB_COLUMNS: &str = r#"
    id, owner_id, parent_id, kind, payload, status, priority,
    progress_percent, progress_message, created_at, started_at, completed_at,
    heartbeat_at, timeout_seconds, retry_on_timeout, retry_count, max_retries,
    worker_id, error_code, error_message, error_details, result_ref, version
"#;

/// Job store backed by a Postgres pool
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1::BIGINT FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<Job> {
        let (error_code, error_message, error_details) = split_failure(job.error.as_ref());

        let result = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            INSERT INTO jobs (
                id, owner_id, parent_id, kind, payload, status, priority,
                progress_percent, progress_message, created_at, started_at, completed_at,
                timeout_seconds, retry_on_timeout, retry_count, max_retries, worker_id,
                error_code, error_message, error_details, result_ref, version, heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(&job.owner_id)
        .bind(job.parent_id)
        .bind(&job.work.kind)
        .bind(&job.work.payload)
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.progress_percent)
        .bind(&job.progress_message)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.timeout_seconds))
        .bind(job.retry_on_timeout)
        .bind(to_i32(job.retry_count))
        .bind(to_i32(job.max_retries))
        .bind(&job.worker_id)
        .bind(error_code)
        .bind(error_message)
        .bind(error_details)
        .bind(&job.result_ref)
        .bind(job.version)
        .bind(job.heartbeat_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row.try_into(),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                Err(StoreError::Conflict(job.id))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
    }

    async fn update(&self, job: &Job) -> Result<Job> {
        let (error_code, error_message, error_details) = split_failure(job.error.as_ref());

        // The stored row is returned so callers see timestamps at column
        // precision, not the nanoseconds they sent
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET owner_id = $3, parent_id = $4, kind = $5, payload = $6, status = $7,
                priority = $8, progress_percent = $9, progress_message = $10,
                started_at = $11, completed_at = $12, timeout_seconds = $13,
                retry_on_timeout = $14, retry_count = $15, max_retries = $16,
                worker_id = $17, error_code = $18, error_message = $19,
                error_details = $20, result_ref = $21, heartbeat_at = $22,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job.id)
        .bind(job.version)
        .bind(&job.owner_id)
        .bind(job.parent_id)
        .bind(&job.work.kind)
        .bind(&job.work.payload)
        .bind(job.status.as_str())
        .bind(job.priority.rank())
        .bind(job.progress_percent)
        .bind(&job.progress_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(to_i64(job.timeout_seconds))
        .bind(job.retry_on_timeout)
        .bind(to_i32(job.retry_count))
        .bind(to_i32(job.max_retries))
        .bind(&job.worker_id)
        .bind(error_code)
        .bind(error_message)
        .bind(error_details)
        .bind(&job.result_ref)
        .bind(job.heartbeat_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None if self.exists(job.id).await? => Err(StoreError::StaleVersion(job.id)),
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    async fn update_progress(
        &self,
        id: Uuid,
        version: i64,
        percent: f64,
        message: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress_percent = GREATEST(progress_percent, $3),
                progress_message = COALESCE($4, progress_message),
                heartbeat_at = NOW()
            WHERE id = $1 AND version = $2 AND status = 'Running'
            "#,
        )
        .bind(id)
        .bind(version)
        .bind(percent.clamp(0.0, 100.0))
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, id: Uuid, version: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = NOW() WHERE id = $1 AND version = $2 AND status = 'Running'",
        )
        .bind(id)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_by_owner(&self, owner_id: &str, query: &OwnerJobsQuery) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE owner_id = $1
              AND ($2::VARCHAR IS NULL OR status = $2)
              AND ($3 OR status IN ('Pending', 'Running'))
            ORDER BY created_at DESC, seq DESC
            LIMIT $4
            "#,
            JOB_COLUMNS
        ))
        .bind(owner_id)
        .bind(query.status.map(|s| s.as_str()))
        .bind(query.include_finished)
        .bind(to_i64(query.limit as u64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list_pending(&self, priority: Option<Priority>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE status = 'Pending'
              AND ($1::SMALLINT IS NULL OR priority = $1)
            ORDER BY priority DESC, created_at ASC, seq ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(priority.map(|p| p.rank()))
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list_claimable(&self, kinds: &[String], limit: usize) -> Result<Vec<Job>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {}
            FROM jobs
            WHERE status = 'Pending'
              AND parent_id IS NULL
              AND kind = ANY($1)
            ORDER BY priority DESC, created_at ASC, seq ASC
            LIMIT $2
            "#,
            JOB_COLUMNS
        ))
        .bind(kinds)
        .bind(to_i64(limit as u64))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE parent_id = $1 ORDER BY seq ASC",
            JOB_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn cleanup_older_than(&self, max_age: Duration, excluded: &[JobStatus]) -> Result<u64> {
        let cutoff = cutoff(Utc::now(), max_age);
        let excluded: Vec<String> = excluded.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status NOT IN ('Pending', 'Running')
              AND completed_at IS NOT NULL
              AND completed_at < $1
              AND status <> ALL($2)
            "#,
        )
        .bind(cutoff)
        .bind(&excluded)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                "Cleaned up {} job(s) completed before {}",
                result.rows_affected(),
                cutoff
            );
        }
        Ok(result.rows_affected())
    }

    async fn statistics(&self, window: Duration) -> Result<JobStatistics> {
        let since = cutoff(Utc::now(), window);

        let status_rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE created_at >= $1 GROUP BY status",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BTreeMap::new();
        for (status, count) in status_rows {
            let status = status.parse::<JobStatus>().map_err(|e| StoreError::Corrupt {
                id: Uuid::nil(),
                reason: e.to_string(),
            })?;
            counts.insert(status, count.max(0) as u64);
        }
        let total = counts.values().sum();

        let average_processing_secs = sqlx::query_scalar::<_, Option<f64>>(
            r#"
            SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))::FLOAT8
            FROM jobs
            WHERE created_at >= $1
              AND status = 'Completed'
              AND started_at IS NOT NULL
              AND completed_at IS NOT NULL
            "#,
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        let oldest_pending = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MIN(created_at) FROM jobs WHERE status = 'Pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        let depth_rows = sqlx::query_as::<_, (i16, i64)>(
            "SELECT priority, COUNT(*) FROM jobs WHERE status = 'Pending' GROUP BY priority",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending_by_priority: BTreeMap<Priority, u64> =
            Priority::ALL.into_iter().map(|p| (p, 0)).collect();
        for (rank, count) in depth_rows {
            if let Some(priority) = Priority::from_rank(rank) {
                pending_by_priority.insert(priority, count.max(0) as u64);
            }
        }

        let running_count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'Running'")
                .fetch_one(&self.pool)
                .await?;

        Ok(JobStatistics {
            window_secs: window.as_secs(),
            failure_rate: failure_rate(&counts),
            counts,
            total,
            average_processing_secs,
            oldest_pending_age_secs: oldest_pending.map(age_secs),
            pending_by_priority,
            running_count: running_count.max(0) as u64,
        })
    }

    async fn recover_orphaned(&self, timeout: Duration) -> Result<u64> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'Failed',
                completed_at = $2,
                error_code = $3,
                error_message = $4,
                error_details = NULL,
                version = version + 1
            WHERE status = 'Running' AND COALESCE(heartbeat_at, started_at) < $1
            "#,
        )
        .bind(cutoff(now, timeout))
        .bind(now)
        .bind(ErrorCode::Orphaned.as_str())
        .bind(orphan_message(timeout))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!("Recovered {} orphaned job(s)", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    async fn running_count_for_worker(&self, worker_id: &str) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE status = 'Running' AND worker_id = $1",
        )
        .bind(worker_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn split_failure(
    failure: Option<&JobFailure>,
) -> (Option<&'static str>, Option<String>, Option<serde_json::Value>) {
    match failure {
        Some(f) => (
            Some(f.code.as_str()),
            Some(f.message.clone()),
            f.details.clone(),
        ),
        None => (None, None, None),
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn age_secs(since: DateTime<Utc>) -> f64 {
    let age = Utc::now().signed_duration_since(since);
    (age.num_milliseconds() as f64 / 1000.0).max(0.0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: String,
    parent_id: Option<Uuid>,
    kind: String,
    payload: serde_json::Value,
    status: String,
    priority: i16,
    progress_percent: f64,
    progress_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    timeout_seconds: i64,
    retry_on_timeout: bool,
    retry_count: i32,
    max_retries: i32,
    worker_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    error_details: Option<serde_json::Value>,
    result_ref: Option<serde_json::Value>,
    version: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id,
            reason,
        };

        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let priority = Priority::from_rank(row.priority)
            .ok_or_else(|| corrupt(format!("unknown priority rank {}", row.priority)))?;

        let error = match row.error_code {
            Some(code) => {
                let code = code
                    .parse::<ErrorCode>()
                    .map_err(|e| corrupt(e.to_string()))?;
                Some(JobFailure {
                    code,
                    message: row.error_message.clone().unwrap_or_default(),
                    details: row.error_details.clone(),
                })
            }
            None => None,
        };

        Ok(Job {
            id: row.id,
            owner_id: row.owner_id,
            parent_id: row.parent_id,
            work: WorkSpec::new(row.kind, row.payload),
            status,
            priority,
            progress_percent: row.progress_percent,
            progress_message: row.progress_message,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            heartbeat_at: row.heartbeat_at,
            timeout_seconds: u64::try_from(row.timeout_seconds).unwrap_or(0),
            retry_on_timeout: row.retry_on_timeout,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            max_retries: u32::try_from(row.max_retries).unwrap_or(0),
            worker_id: row.worker_id,
            error,
            result_ref: row.result_ref,
            version: row.version,
        })
    }
}
