//! Job events
//!
//! Events are published to the notification hub on every job transition and
//! progress change. Their serialized form is what transports forward to
//! clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::bulk::BulkSnapshot;
use crate::domain::job::{Job, JobFailure, JobStatus};
use crate::domain::progress::ProgressSnapshot;

/// An event concerning one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// The job record changed status
    Status {
        status: JobStatus,
        retry_count: u32,
        progress_percent: f64,
        error: Option<JobFailure>,
        result_ref: Option<serde_json::Value>,
    },
    /// The running attempt reported progress
    Progress {
        percent: f64,
        step: Option<String>,
        message: Option<String>,
        estimated_remaining_secs: Option<f64>,
    },
    /// A failed attempt will be retried after a backoff delay
    Retrying {
        next_attempt: u32,
        delay_secs: f64,
        error: JobFailure,
    },
    /// The composite view of a bulk job changed
    Bulk {
        status: JobStatus,
        percent: f64,
        sub_units: BTreeMap<String, JobStatus>,
        error_message: Option<String>,
    },
}

impl JobEvent {
    pub fn new(job_id: Uuid, payload: EventPayload) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Status event reflecting the current job record
    pub fn status(job: &Job) -> Self {
        Self::new(
            job.id,
            EventPayload::Status {
                status: job.status,
                retry_count: job.retry_count,
                progress_percent: job.progress_percent,
                error: job.error.clone(),
                result_ref: job.result_ref.clone(),
            },
        )
    }

    pub fn progress(job_id: Uuid, snapshot: &ProgressSnapshot) -> Self {
        Self::new(
            job_id,
            EventPayload::Progress {
                percent: snapshot.overall_percent,
                step: snapshot.current_step.clone(),
                message: snapshot.message.clone(),
                estimated_remaining_secs: snapshot.estimated_remaining_secs,
            },
        )
    }

    pub fn retrying(
        job_id: Uuid,
        next_attempt: u32,
        delay: std::time::Duration,
        error: JobFailure,
    ) -> Self {
        Self::new(
            job_id,
            EventPayload::Retrying {
                next_attempt,
                delay_secs: delay.as_secs_f64(),
                error,
            },
        )
    }

    pub fn bulk(snapshot: &BulkSnapshot) -> Self {
        Self::new(
            snapshot.bulk_job_id,
            EventPayload::Bulk {
                status: snapshot.status,
                percent: snapshot.progress_percent,
                sub_units: snapshot.sub_unit_status(),
                error_message: snapshot.error_message.clone(),
            },
        )
    }

    /// Whether this event reports an end state for the job
    pub fn is_final(&self) -> bool {
        match &self.payload {
            EventPayload::Status { status, .. } | EventPayload::Bulk { status, .. } => {
                status.is_finished()
            }
            EventPayload::Progress { .. } | EventPayload::Retrying { .. } => false,
        }
    }
}
