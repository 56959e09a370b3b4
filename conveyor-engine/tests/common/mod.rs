//! Shared test stores
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use conveyor_core::domain::job::{Job, JobStatus, Priority};
use conveyor_core::dto::job::OwnerJobsQuery;
use conveyor_core::dto::stats::JobStatistics;
use conveyor_store::{JobStore, MemoryJobStore, Result as StoreResult};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Store that keeps timestamps at microsecond precision, like a TIMESTAMPTZ
/// column, and answers writes with the caller's record instead of the stored
/// one
#[derive(Default)]
pub struct MicrosJobStore {
    inner: MemoryJobStore,
}

fn micros(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}

fn truncated(job: &Job) -> Job {
    let mut job = job.clone();
    job.created_at = micros(job.created_at);
    job.started_at = job.started_at.map(micros);
    job.completed_at = job.completed_at.map(micros);
    job.heartbeat_at = job.heartbeat_at.map(micros);
    job
}

#[async_trait]
impl JobStore for MicrosJobStore {
    async fn create(&self, job: &Job) -> StoreResult<Job> {
        self.inner.create(&truncated(job)).await?;
        Ok(job.clone())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Job> {
        self.inner.get(id).await
    }

    async fn update(&self, job: &Job) -> StoreResult<Job> {
        let stored = self.inner.update(&truncated(job)).await?;
        let mut echoed = job.clone();
        echoed.version = stored.version;
        Ok(echoed)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        version: i64,
        percent: f64,
        message: Option<&str>,
    ) -> StoreResult<bool> {
        self.inner.update_progress(id, version, percent, message).await
    }

    async fn heartbeat(&self, id: Uuid, version: i64) -> StoreResult<bool> {
        self.inner.heartbeat(id, version).await
    }

    async fn list_by_owner(&self, owner_id: &str, query: &OwnerJobsQuery) -> StoreResult<Vec<Job>> {
        self.inner.list_by_owner(owner_id, query).await
    }

    async fn list_pending(&self, priority: Option<Priority>, limit: usize) -> StoreResult<Vec<Job>> {
        self.inner.list_pending(priority, limit).await
    }

    async fn list_claimable(&self, kinds: &[String], limit: usize) -> StoreResult<Vec<Job>> {
        self.inner.list_claimable(kinds, limit).await
    }

    async fn list_children(&self, parent_id: Uuid) -> StoreResult<Vec<Job>> {
        self.inner.list_children(parent_id).await
    }

    async fn delete(&self, id: Uuid) -> StoreResult<()> {
        self.inner.delete(id).await
    }

    async fn cleanup_older_than(&self, max_age: Duration, excluded: &[JobStatus]) -> StoreResult<u64> {
        self.inner.cleanup_older_than(max_age, excluded).await
    }

    async fn statistics(&self, window: Duration) -> StoreResult<JobStatistics> {
        self.inner.statistics(window).await
    }

    async fn recover_orphaned(&self, timeout: Duration) -> StoreResult<u64> {
        self.inner.recover_orphaned(timeout).await
    }

    async fn running_count_for_worker(&self, worker_id: &str) -> StoreResult<u64> {
        self.inner.running_count_for_worker(worker_id).await
    }
}

/// Every store backend the engine is exercised against
pub fn stores() -> Vec<(&'static str, Arc<dyn JobStore>)> {
    vec![
        ("memory", Arc::new(MemoryJobStore::new())),
        ("micros", Arc::new(MicrosJobStore::default())),
    ]
}
