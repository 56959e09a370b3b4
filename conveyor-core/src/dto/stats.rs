//! Statistics DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::job::{JobStatus, Priority};

/// Aggregate view of the jobs created within a time window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatistics {
    pub window_secs: u64,
    pub counts: BTreeMap<JobStatus, u64>,
    pub total: u64,
    /// Failed and TimedOut over all finished attempts that did not get cancelled
    pub failure_rate: f64,
    pub average_processing_secs: Option<f64>,
    pub oldest_pending_age_secs: Option<f64>,
    pub pending_by_priority: BTreeMap<Priority, u64>,
    pub running_count: u64,
}

impl JobStatistics {
    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// Failure rate over finished jobs, excluding cancellations
///
/// Returns 0.0 when nothing has finished yet.
pub fn failure_rate(counts: &BTreeMap<JobStatus, u64>) -> f64 {
    let get = |s: JobStatus| counts.get(&s).copied().unwrap_or(0);
    let failed = get(JobStatus::Failed) + get(JobStatus::TimedOut);
    let finished = failed + get(JobStatus::Completed);
    if finished == 0 {
        0.0
    } else {
        failed as f64 / finished as f64
    }
}

/// Operational health of the queue as seen by one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub queue_depth: BTreeMap<Priority, u64>,
    pub total_pending: u64,
    pub running_count: u64,
    pub failure_rate: f64,
    pub oldest_pending_age_secs: Option<f64>,
    pub worker_id: String,
    /// Jobs this worker owns according to the store
    pub worker_running_count: u64,
    /// Attempts this process is currently awaiting
    pub in_flight: usize,
}
