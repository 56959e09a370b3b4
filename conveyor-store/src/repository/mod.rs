//! Repository layer
//!
//! [`JobStore`] is the durable CRUD and query surface for job records. All
//! implementations share the same ordering and filtering semantics:
//!
//! - `list_pending` returns Urgent, High, Normal, Low, and FIFO within a band
//! - `list_by_owner` returns newest first
//! - `update` is an optimistic compare-and-swap on `version`
//! - `cleanup_older_than` never touches Pending or Running jobs

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::domain::job::{Job, JobStatus, Priority};
use conveyor_core::dto::job::OwnerJobsQuery;
use conveyor_core::dto::stats::JobStatistics;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Persistence port for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job
    ///
    /// Fails with `Conflict` when the id is already taken.
    async fn create(&self, job: &Job) -> Result<Job>;

    async fn get(&self, id: Uuid) -> Result<Job>;

    /// Replaces the whole record if `job.version` matches the stored one
    ///
    /// Returns the record as stored, with its bumped version. Timestamps may
    /// come back at the store's precision. Fails with `StaleVersion`
    /// when another writer got there first, `NotFound` if it was deleted.
    async fn update(&self, job: &Job) -> Result<Job>;

    /// Raises the progress of a running attempt
    ///
    /// Only applies while the job is Running at `version`, the version its
    /// attempt was claimed with. The stored percentage never decreases and
    /// the heartbeat is refreshed. Returns false when nothing changed.
    async fn update_progress(
        &self,
        id: Uuid,
        version: i64,
        percent: f64,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Refreshes `heartbeat_at` of a job Running at `version`
    async fn heartbeat(&self, id: Uuid, version: i64) -> Result<bool>;

    async fn list_by_owner(&self, owner_id: &str, query: &OwnerJobsQuery) -> Result<Vec<Job>>;

    async fn list_pending(&self, priority: Option<Priority>, limit: usize) -> Result<Vec<Job>>;

    /// Pending top-level jobs of the given kinds, in dequeue order
    ///
    /// Used by worker pools: sub-units (jobs with a parent) are driven by
    /// their bulk orchestrator and never returned here.
    async fn list_claimable(&self, kinds: &[String], limit: usize) -> Result<Vec<Job>>;

    /// Sub-unit jobs of a bulk job, in submission order
    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>>;

    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Deletes finished jobs completed before `now - max_age`
    ///
    /// Jobs whose status is in `excluded` are kept. Pending and Running jobs
    /// are never deleted.
    async fn cleanup_older_than(&self, max_age: Duration, excluded: &[JobStatus]) -> Result<u64>;

    /// Counts, failure rate and timings for jobs created within `window`,
    /// plus current queue depth and running count
    async fn statistics(&self, window: Duration) -> Result<JobStatistics>;

    /// Fails Running jobs whose last heartbeat (or `started_at` when none was
    /// recorded) is older than `timeout`
    ///
    /// Recovered jobs get the `Orphaned` error code. Calling this twice
    /// recovers each job once.
    async fn recover_orphaned(&self, timeout: Duration) -> Result<u64>;

    async fn running_count_for_worker(&self, worker_id: &str) -> Result<u64>;
}

// =============================================================================
// Helper Functions
// =============================================================================

/// `now - age`, saturating at the earliest representable instant
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn orphan_message(timeout: Duration) -> String {
    format!(
        "job was still running after {}s without its worker finishing it",
        timeout.as_secs()
    )
}
