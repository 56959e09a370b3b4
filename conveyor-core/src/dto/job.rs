//! Job DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{JobStatus, Priority, WorkSpec};

/// Request to submit a new job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub owner_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to the engine's default timeout when absent
    pub timeout_seconds: Option<u64>,
    /// Falls back to the engine's default retry budget when absent
    pub max_retries: Option<u32>,
    pub work: WorkSpec,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default = "default_retry_on_timeout")]
    pub retry_on_timeout: bool,
}

fn default_retry_on_timeout() -> bool {
    true
}

impl SubmitJob {
    pub fn new(owner_id: impl Into<String>, work: WorkSpec) -> Self {
        Self {
            owner_id: owner_id.into(),
            priority: Priority::default(),
            timeout_seconds: None,
            max_retries: None,
            work,
            parent_id: None,
            retry_on_timeout: true,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Opts out of retrying attempts that exceed their timeout
    pub fn without_timeout_retries(mut self) -> Self {
        self.retry_on_timeout = false;
        self
    }
}

/// Filter for listing a single owner's jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerJobsQuery {
    pub status: Option<JobStatus>,
    /// Include jobs that reached an end state
    pub include_finished: bool,
    pub limit: usize,
}

impl Default for OwnerJobsQuery {
    fn default() -> Self {
        Self {
            status: None,
            include_finished: true,
            limit: 50,
        }
    }
}

impl OwnerJobsQuery {
    /// Whether a job with `status` passes this filter
    pub fn matches(&self, status: JobStatus) -> bool {
        if let Some(wanted) = self.status {
            if wanted != status {
                return false;
            }
        }
        self.include_finished || !status.is_finished()
    }
}
