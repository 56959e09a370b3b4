//! Store errors

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {0} already exists")]
    Conflict(Uuid),

    /// The record changed since it was read
    #[error("job {0} was modified concurrently")]
    StaleVersion(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// A persisted row could not be mapped back to a job
    #[error("corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
