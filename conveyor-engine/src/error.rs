//! Engine errors

use conveyor_core::domain::job::{ErrorCode, JobFailure, JobStatus};
use conveyor_store::StoreError;
use uuid::Uuid;

/// Errors returned by scheduler and bulk operations
///
/// Once a job has started, failures of the work itself are recorded on the
/// job record instead of being returned here.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {status}, which does not allow this operation")]
    InvalidState { id: Uuid, status: JobStatus },

    #[error("job {id} has used {retry_count} of {max_retries} retries")]
    RetriesExhausted {
        id: Uuid,
        retry_count: u32,
        max_retries: u32,
    },

    #[error(transparent)]
    Storage(StoreError),

    /// Startup recovery has not completed yet
    #[error("scheduler is not ready: startup recovery has not run")]
    NotReady,

    /// A background task driving the operation panicked or was aborted
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl SchedulerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::Validation(_) | SchedulerError::InvalidState { .. } => {
                ErrorCode::Validation
            }
            SchedulerError::NotFound(_)
            | SchedulerError::Storage(_)
            | SchedulerError::NotReady => ErrorCode::Storage,
            SchedulerError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            SchedulerError::TaskFailed(_) => ErrorCode::TerminalWork,
        }
    }
}

impl From<StoreError> for SchedulerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SchedulerError::NotFound(id),
            other => SchedulerError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Error returned by a work function
#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkError {
    /// Worth another attempt after a backoff
    #[error("{message}")]
    Retryable {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Retrying would not help
    #[error("{message}")]
    Terminal {
        message: String,
        details: Option<serde_json::Value>,
    },
}

impl WorkError {
    pub fn retryable(message: impl Into<String>) -> Self {
        WorkError::Retryable {
            message: message.into(),
            details: None,
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        WorkError::Terminal {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(self, details: serde_json::Value) -> Self {
        match self {
            WorkError::Retryable { message, .. } => WorkError::Retryable {
                message,
                details: Some(details),
            },
            WorkError::Terminal { message, .. } => WorkError::Terminal {
                message,
                details: Some(details),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkError::Retryable { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            WorkError::Retryable { .. } => ErrorCode::RetryableWork,
            WorkError::Terminal { .. } => ErrorCode::TerminalWork,
        }
    }

    /// The failure payload persisted on the job
    pub fn to_failure(&self) -> JobFailure {
        let (message, details) = match self {
            WorkError::Retryable { message, details } | WorkError::Terminal { message, details } => {
                (message, details)
            }
        };
        let failure = JobFailure::new(self.code(), message.clone());
        match details {
            Some(details) => failure.with_details(details.clone()),
            None => failure,
        }
    }
}

/// Delivery failure reported by a notification sink
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The observer is too slow; this event is dropped
    #[error("sink buffer is full")]
    Full,

    /// The observer is gone and its sink can be removed
    #[error("sink is closed")]
    Closed,

    #[error("delivery failed: {0}")]
    Other(String),
}
