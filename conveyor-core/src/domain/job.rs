//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Job record
///
/// Structure shared between the store (persists) and the engine (mutates).
/// Only the scheduler changes status, timing, error and worker fields; the
/// owning execution attempt only raises `progress_percent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    /// Bulk job this record is a sub-unit of
    pub parent_id: Option<Uuid>,
    pub work: WorkSpec,
    pub status: JobStatus,
    pub priority: Priority,
    pub progress_percent: f64,
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last liveness signal from the owning worker; orphan detection prefers
    /// it over `started_at`
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Wall-clock budget for a single execution attempt
    pub timeout_seconds: u64,
    /// Whether a timed out attempt may be retried
    pub retry_on_timeout: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_id: Option<String>,
    pub error: Option<JobFailure>,
    /// Opaque reference to the produced artifact
    pub result_ref: Option<serde_json::Value>,
    /// Optimistic lock counter, bumped by every successful store update
    pub version: i64,
}

/// What a job does, as understood by the work function registered for `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkSpec {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Error payload carried on a job in a Failed, TimedOut or Cancelled state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Failed => "Failed",
            JobStatus::Cancelled => "Cancelled",
            JobStatus::TimedOut => "TimedOut",
        }
    }

    /// Whether the job has reached an end state (`completed_at` is set)
    pub fn is_finished(&self) -> bool {
        match self {
            JobStatus::Pending | JobStatus::Running => false,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut => {
                true
            }
        }
    }

    /// Whether no transition can ever leave this status
    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Cancelled => true,
            JobStatus::Pending | JobStatus::Running | JobStatus::Failed | JobStatus::TimedOut => {
                false
            }
        }
    }

    /// Failed and TimedOut both count as failures in statistics and composites
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("status", s))
    }
}

/// Scheduling priority; the derived order is the dequeue order (highest first)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "Low",
            Priority::Normal => "Normal",
            Priority::High => "High",
            Priority::Urgent => "Urgent",
        }
    }

    /// Numeric rank stored in the database so `ORDER BY priority DESC` works
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        Priority::ALL.into_iter().find(|p| p.rank() == rank)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Priority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseEnumError::new("priority", s))
    }
}

/// Machine-readable error code persisted on failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    Storage,
    Timeout,
    RetryableWork,
    TerminalWork,
    RetriesExhausted,
    Orphaned,
    Cancelled,
    Finalize,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::Validation,
        ErrorCode::Storage,
        ErrorCode::Timeout,
        ErrorCode::RetryableWork,
        ErrorCode::TerminalWork,
        ErrorCode::RetriesExhausted,
        ErrorCode::Orphaned,
        ErrorCode::Cancelled,
        ErrorCode::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "Validation",
            ErrorCode::Storage => "Storage",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::RetryableWork => "RetryableWork",
            ErrorCode::TerminalWork => "TerminalWork",
            ErrorCode::RetriesExhausted => "RetriesExhausted",
            ErrorCode::Orphaned => "Orphaned",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Finalize => "Finalize",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("error code", s))
    }
}

/// Returned when a status, priority or error code string is not recognised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

impl Job {
    /// Creates a new pending job
    pub fn new(
        owner_id: impl Into<String>,
        work: WorkSpec,
        priority: Priority,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            parent_id: None,
            work,
            status: JobStatus::Pending,
            priority,
            progress_percent: 0.0,
            progress_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            timeout_seconds,
            retry_on_timeout: true,
            retry_count: 0,
            max_retries,
            worker_id: None,
            error: None,
            result_ref: None,
            version: 0,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry_on_timeout: bool) -> Self {
        self.retry_on_timeout = retry_on_timeout;
        self
    }

    /// Whether another attempt is still within budget
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether `worker_id` currently owns this job
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.worker_id.as_deref() == Some(worker_id)
    }

    /// Wall-clock time between start and completion
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed.signed_duration_since(started)),
            _ => None,
        }
    }

    /// Pending -> Running, assigning the executing worker
    pub fn mark_running(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.heartbeat_at = Some(now);
        self.completed_at = None;
        self.worker_id = Some(worker_id.to_string());
        self.progress_percent = 0.0;
        self.progress_message = None;
        self.error = None;
    }

    /// Running -> Completed
    pub fn mark_completed(&mut self, result_ref: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(now);
        self.progress_percent = 100.0;
        self.result_ref = result_ref;
        self.error = None;
    }

    /// Running -> Failed or TimedOut
    pub fn mark_failed(&mut self, status: JobStatus, failure: JobFailure, now: DateTime<Utc>) {
        debug_assert!(status.is_failure());
        self.status = status;
        self.completed_at = Some(now);
        self.error = Some(failure);
    }

    /// Running -> Running: records a failed attempt that will be retried
    ///
    /// The job stays owned by its worker through the backoff, so it can still
    /// be cancelled. `retry_count` is consumed when the next attempt starts.
    pub fn mark_retrying(&mut self, failure: JobFailure, now: DateTime<Utc>) {
        debug_assert!(self.status == JobStatus::Running);
        self.heartbeat_at = Some(now);
        self.progress_percent = 0.0;
        self.progress_message = None;
        self.error = Some(failure);
    }

    /// Pending or Running -> Cancelled
    pub fn mark_cancelled(&mut self, reason: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(now);
        self.error = Some(JobFailure::new(ErrorCode::Cancelled, reason));
    }

    /// Failed or TimedOut -> Pending, consuming one retry
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.retry_count += 1;
        self.started_at = None;
        self.heartbeat_at = None;
        self.completed_at = None;
        self.worker_id = None;
        self.progress_percent = 0.0;
        self.progress_message = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            "owner-1",
            WorkSpec::new("export", serde_json::json!({"format": "pdf"})),
            Priority::High,
            60,
            2,
        )
    }

    #[test]
    fn test_new_job_is_pending_without_timestamps() {
        let job = job();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.error.is_none());
        assert!(job.retry_on_timeout);
        assert_eq!(job.version, 0);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Urgent > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("urgent".parse::<Priority>().unwrap(), Priority::Urgent);
        assert_eq!("TimedOut".parse::<JobStatus>().unwrap(), JobStatus::TimedOut);
        assert_eq!("Orphaned".parse::<ErrorCode>().unwrap(), ErrorCode::Orphaned);

        let err = "critical".parse::<Priority>().unwrap_err();
        assert_eq!(err.kind, "priority");
        assert!(err.to_string().contains("critical"));
    }

    #[test]
    fn test_status_classification() {
        assert!(!JobStatus::Pending.is_finished());
        assert!(!JobStatus::Running.is_finished());
        assert!(JobStatus::Failed.is_finished());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::TimedOut.is_failure());
        assert!(!JobStatus::Cancelled.is_failure());
    }

    #[test]
    fn test_lifecycle_keeps_invariants() {
        let mut job = job();
        let now = Utc::now();

        job.mark_running("worker-a", now);
        assert!(job.is_owned_by("worker-a"));
        assert!(!job.is_owned_by("worker-b"));
        assert!(job.completed_at.is_none());

        job.mark_failed(
            JobStatus::Failed,
            JobFailure::new(ErrorCode::RetryableWork, "boom"),
            now,
        );
        assert!(job.completed_at.is_some());
        assert_eq!(job.error.as_ref().map(|e| e.code), Some(ErrorCode::RetryableWork));
        assert!(job.can_retry());

        job.reset_for_retry();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.error.is_none());
        assert!(job.worker_id.is_none());

        job.mark_running("worker-b", now);
        job.mark_completed(Some(serde_json::json!("s3://bucket/out.pdf")), now);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100.0);
        assert!(job.processing_time().is_some());
    }

    #[test]
    fn test_retrying_keeps_ownership() {
        let mut job = job();
        let started = Utc::now() - chrono::Duration::seconds(30);
        job.mark_running("worker-a", started);
        job.progress_percent = 60.0;

        let now = Utc::now();
        job.mark_retrying(JobFailure::new(ErrorCode::RetryableWork, "503"), now);
        assert!(job.is_owned_by("worker-a"));
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.progress_percent, 0.0);
        assert_eq!(job.started_at, Some(started));
        assert_eq!(job.heartbeat_at, Some(now));
        assert!(job.completed_at.is_none());
        assert_eq!(job.error.map(|e| e.message), Some("503".to_string()));
    }

    #[test]
    fn test_cancel_records_reason() {
        let mut job = job();
        job.mark_cancelled("user requested", Utc::now());
        assert_eq!(job.status, JobStatus::Cancelled);
        let failure = job.error.unwrap();
        assert_eq!(failure.code, ErrorCode::Cancelled);
        assert_eq!(failure.message, "user requested");
    }

    #[test]
    fn test_retry_budget() {
        let mut job = job();
        job.retry_count = 2;
        assert!(!job.can_retry());
    }
}
