//! In-memory Job Store
//!
//! Same semantics as the Postgres store, held in a mutex-guarded map. Used as
//! a test double and for single-process deployments without a database.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::domain::job::{ErrorCode, Job, JobFailure, JobStatus, Priority};
use conveyor_core::dto::job::OwnerJobsQuery;
use conveyor_core::dto::stats::{JobStatistics, failure_rate};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{JobStore, cutoff, orphan_message};
use crate::error::{Result, StoreError};

#[derive(Default)]
struct State {
    /// Job plus its arrival sequence number
    jobs: HashMap<Uuid, (u64, Job)>,
    next_seq: u64,
}

impl State {
    fn sorted<F>(&self, filter: F) -> Vec<(u64, &Job)>
    where
        F: Fn(&Job) -> bool,
    {
        let mut jobs: Vec<(u64, &Job)> = self
            .jobs
            .values()
            .filter(|(_, job)| filter(job))
            .map(|(seq, job)| (*seq, job))
            .collect();
        jobs.sort_by_key(|(seq, _)| *seq);
        jobs
    }
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<Job> {
        let mut state = self.lock();
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Conflict(job.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(job.id, (seq, job.clone()));
        Ok(job.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Job> {
        self.lock()
            .jobs
            .get(&id)
            .map(|(_, job)| job.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(&self, job: &Job) -> Result<Job> {
        let mut state = self.lock();
        let (_, stored) = state
            .jobs
            .get_mut(&job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        if stored.version != job.version {
            return Err(StoreError::StaleVersion(job.id));
        }
        let mut updated = job.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn update_progress(
        &self,
        id: Uuid,
        version: i64,
        percent: f64,
        message: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.lock();
        let (_, job) = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running || job.version != version {
            return Ok(false);
        }
        job.progress_percent = job.progress_percent.max(percent.clamp(0.0, 100.0));
        if let Some(message) = message {
            job.progress_message = Some(message.to_string());
        }
        job.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn heartbeat(&self, id: Uuid, version: i64) -> Result<bool> {
        let mut state = self.lock();
        let (_, job) = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status != JobStatus::Running || job.version != version {
            return Ok(false);
        }
        job.heartbeat_at = Some(Utc::now());
        Ok(true)
    }

    async fn list_by_owner(&self, owner_id: &str, query: &OwnerJobsQuery) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs = state.sorted(|job| job.owner_id == owner_id && query.matches(job.status));
        jobs.sort_by_key(|(seq, job)| Reverse((job.created_at, *seq)));
        Ok(jobs
            .into_iter()
            .take(query.limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn list_pending(&self, priority: Option<Priority>, limit: usize) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs = state.sorted(|job| {
            job.status == JobStatus::Pending && priority.is_none_or(|p| job.priority == p)
        });
        jobs.sort_by_key(|(seq, job)| (Reverse(job.priority), job.created_at, *seq));
        Ok(jobs
            .into_iter()
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn list_claimable(&self, kinds: &[String], limit: usize) -> Result<Vec<Job>> {
        let state = self.lock();
        let mut jobs = state.sorted(|job| {
            job.status == JobStatus::Pending
                && job.parent_id.is_none()
                && kinds.iter().any(|k| *k == job.work.kind)
        });
        jobs.sort_by_key(|(seq, job)| (Reverse(job.priority), job.created_at, *seq));
        Ok(jobs
            .into_iter()
            .take(limit)
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn list_children(&self, parent_id: Uuid) -> Result<Vec<Job>> {
        let state = self.lock();
        Ok(state
            .sorted(|job| job.parent_id == Some(parent_id))
            .into_iter()
            .map(|(_, job)| job.clone())
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.lock()
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    async fn cleanup_older_than(&self, max_age: Duration, excluded: &[JobStatus]) -> Result<u64> {
        let cutoff = cutoff(Utc::now(), max_age);
        let mut state = self.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, (_, job)| {
            let expired = job.status.is_finished()
                && !excluded.contains(&job.status)
                && job.completed_at.is_some_and(|at| at < cutoff);
            !expired
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn statistics(&self, window: Duration) -> Result<JobStatistics> {
        let now = Utc::now();
        let since = cutoff(now, window);
        let state = self.lock();

        let mut counts = BTreeMap::new();
        let mut processing = Vec::new();
        let mut pending_by_priority: BTreeMap<Priority, u64> =
            Priority::ALL.into_iter().map(|p| (p, 0)).collect();
        let mut oldest_pending = None;
        let mut running_count = 0;

        for (_, job) in state.jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    *pending_by_priority.entry(job.priority).or_default() += 1;
                    oldest_pending = Some(match oldest_pending {
                        Some(oldest) if oldest <= job.created_at => oldest,
                        _ => job.created_at,
                    });
                }
                JobStatus::Running => running_count += 1,
                JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::TimedOut => {}
            }

            if job.created_at < since {
                continue;
            }
            *counts.entry(job.status).or_insert(0) += 1;
            if job.status == JobStatus::Completed {
                if let Some(elapsed) = job.processing_time() {
                    processing.push(elapsed.num_milliseconds() as f64 / 1000.0);
                }
            }
        }

        let average_processing_secs = if processing.is_empty() {
            None
        } else {
            Some(processing.iter().sum::<f64>() / processing.len() as f64)
        };

        Ok(JobStatistics {
            window_secs: window.as_secs(),
            total: counts.values().sum(),
            failure_rate: failure_rate(&counts),
            counts,
            average_processing_secs,
            oldest_pending_age_secs: oldest_pending.map(|created| {
                (now.signed_duration_since(created).num_milliseconds() as f64 / 1000.0).max(0.0)
            }),
            pending_by_priority,
            running_count,
        })
    }

    async fn recover_orphaned(&self, timeout: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = cutoff(now, timeout);
        let mut state = self.lock();
        let mut recovered = 0;

        for (_, job) in state.jobs.values_mut() {
            let stale = job.status == JobStatus::Running
                && job
                    .heartbeat_at
                    .or(job.started_at)
                    .is_some_and(|seen| seen < cutoff);
            if stale {
                job.mark_failed(
                    JobStatus::Failed,
                    JobFailure::new(ErrorCode::Orphaned, orphan_message(timeout)),
                    now,
                );
                job.version += 1;
                recovered += 1;
            }
        }

        if recovered > 0 {
            tracing::warn!("Recovered {} orphaned job(s)", recovered);
        }
        Ok(recovered)
    }

    async fn running_count_for_worker(&self, worker_id: &str) -> Result<u64> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|(_, job)| job.is_owned_by(worker_id))
            .count() as u64)
    }
}
