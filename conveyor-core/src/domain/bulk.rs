//! Bulk job domain types
//!
//! A bulk job is one logical job split into named sub-units that run as
//! separate job records. Its status is always derived from the sub-units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::job::JobStatus;

/// State of one sub-unit of a bulk job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubUnitState {
    pub name: String,
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Last overall percent reported by the sub-unit's progress model
    pub progress_percent: f64,
    pub result_ref: Option<serde_json::Value>,
}

/// Point-in-time view of a bulk job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSnapshot {
    pub bulk_job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub concurrency_limit: usize,
    /// Sub-units in submission order
    pub sub_units: Vec<SubUnitState>,
    pub finalized: bool,
    pub error_message: Option<String>,
    pub result_ref: Option<serde_json::Value>,
}

impl BulkSnapshot {
    pub fn sub_unit_status(&self) -> BTreeMap<String, JobStatus> {
        self.sub_units
            .iter()
            .map(|u| (u.name.clone(), u.status))
            .collect()
    }

    pub fn successful_count(&self) -> usize {
        self.sub_units
            .iter()
            .filter(|u| u.status == JobStatus::Completed)
            .count()
    }
}

/// Derives the composite status of a bulk job from its sub-units
///
/// - Completed, Failed or Cancelled when every sub-unit agrees
/// - Running while any sub-unit is running, or pending next to started ones
/// - Pending when nothing has started yet
/// - otherwise Failed if anything failed, else Cancelled
///
/// TimedOut sub-units count as failed.
pub fn composite_status<I>(statuses: I) -> JobStatus
where
    I: IntoIterator<Item = JobStatus>,
{
    let mut total = 0usize;
    let mut pending = 0usize;
    let mut running = 0usize;
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;

    for status in statuses {
        total += 1;
        match status {
            JobStatus::Pending => pending += 1,
            JobStatus::Running => running += 1,
            JobStatus::Completed => completed += 1,
            JobStatus::Failed | JobStatus::TimedOut => failed += 1,
            JobStatus::Cancelled => cancelled += 1,
        }
    }

    if total == 0 || pending == total {
        return JobStatus::Pending;
    }
    if completed == total {
        return JobStatus::Completed;
    }
    if failed == total {
        return JobStatus::Failed;
    }
    if cancelled == total {
        return JobStatus::Cancelled;
    }
    if running > 0 || pending > 0 {
        return JobStatus::Running;
    }
    if failed > 0 {
        JobStatus::Failed
    } else {
        JobStatus::Cancelled
    }
}

/// Arithmetic mean of sub-unit percentages; an empty set is 0
pub fn composite_progress<I>(percents: I) -> f64
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = percents
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), p| (sum + p, count + 1));
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn test_all_agree() {
        assert_eq!(composite_status([Completed, Completed, Completed]), Completed);
        assert_eq!(composite_status([Failed, Failed]), Failed);
        assert_eq!(composite_status([Cancelled, Cancelled]), Cancelled);
        assert_eq!(composite_status([Pending, Pending]), Pending);
        assert_eq!(composite_status(std::iter::empty()), Pending);
    }

    #[test]
    fn test_mixed_terminal_outcomes() {
        assert_eq!(composite_status([Completed, Completed, Failed]), Failed);
        assert_eq!(composite_status([Completed, Cancelled]), Cancelled);
        assert_eq!(composite_status([Completed, Cancelled, Failed]), Failed);
        assert_eq!(composite_status([Completed, TimedOut]), Failed);
        assert_eq!(composite_status([TimedOut, Failed]), Failed);
    }

    #[test]
    fn test_running_takes_precedence() {
        assert_eq!(composite_status([Completed, Completed, Running]), Running);
        assert_eq!(composite_status([Failed, Running, Cancelled]), Running);
        assert_eq!(composite_status([Completed, Pending]), Running);
    }

    #[test]
    fn test_composite_progress_is_mean() {
        assert_eq!(composite_progress([100.0, 50.0, 0.0]), 50.0);
        assert_eq!(composite_progress(std::iter::empty()), 0.0);
    }

    #[test]
    fn test_snapshot_helpers() {
        let unit = |name: &str, status| SubUnitState {
            name: name.to_string(),
            job_id: Uuid::new_v4(),
            status,
            progress_percent: 0.0,
            result_ref: None,
        };
        let snapshot = BulkSnapshot {
            bulk_job_id: Uuid::new_v4(),
            status: Running,
            progress_percent: 0.0,
            concurrency_limit: 2,
            sub_units: vec![unit("pdf", Completed), unit("pptx", Running)],
            finalized: false,
            error_message: None,
            result_ref: None,
        };
        assert_eq!(snapshot.successful_count(), 1);
        assert_eq!(snapshot.sub_unit_status().get("pptx"), Some(&Running));
    }
}
