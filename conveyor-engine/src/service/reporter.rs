//! Progress reporter
//!
//! Binds a [`ProgressModel`] to one execution attempt. Each step operation
//! updates the model, raises the persisted progress of the job and publishes
//! a progress event. Persistence failures are logged and otherwise ignored:
//! progress is advisory and the attempt keeps running.
//!
//! A reporter outlives its attempt when the work ignores a timeout. Once the
//! attempt's token fires, or the record has been claimed again, reports are
//! dropped instead of landing on the next attempt.

use conveyor_core::domain::event::JobEvent;
use conveyor_core::domain::job::Job;
use conveyor_core::domain::progress::{ProgressModel, ProgressSnapshot, Result};
use conveyor_store::JobStore;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::hub::NotificationHub;

/// Cloneable handle used by work functions to report step progress
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    /// Version the attempt claimed the record at
    attempt_version: i64,
    model: Arc<Mutex<ProgressModel>>,
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    attempt: CancellationToken,
}

impl ProgressReporter {
    /// Binds a reporter to the attempt that claimed `job`
    pub fn new(
        job: &Job,
        model: ProgressModel,
        store: Arc<dyn JobStore>,
        hub: Arc<NotificationHub>,
        attempt: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            attempt_version: job.version,
            model: Arc::new(Mutex::new(model)),
            store,
            hub,
            attempt,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn start_step(&self, name: &str) -> Result<()> {
        self.apply(|model| model.start_step(name)).await
    }

    /// Records progress within a step; `percent` is clamped to [0, 100]
    pub async fn update_step(&self, name: &str, percent: f64, note: Option<&str>) -> Result<()> {
        self.apply(|model| model.update_step(name, percent, note.map(str::to_string)))
            .await
    }

    pub async fn complete_step(&self, name: &str, details: Option<serde_json::Value>) -> Result<()> {
        self.apply(|model| model.complete_step(name, details)).await
    }

    pub async fn fail_step(&self, name: &str, reason: &str) -> Result<()> {
        self.apply(|model| model.fail_step(name, reason)).await
    }

    pub async fn skip_step(&self, name: &str, reason: &str) -> Result<()> {
        self.apply(|model| model.skip_step(name, reason)).await
    }

    pub async fn cancel_step(&self, name: &str, reason: &str) -> Result<()> {
        self.apply(|model| model.cancel_step(name, reason)).await
    }

    pub fn overall_percent(&self) -> f64 {
        self.lock().overall_percent()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.lock().snapshot()
    }

    async fn apply<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut ProgressModel) -> Result<()>,
    {
        let snapshot = {
            let mut model = self.lock();
            op(&mut model)?;
            model.snapshot()
        };

        if self.attempt.is_cancelled() {
            debug!("Job {} attempt has ended, dropping progress report", self.job_id);
            return Ok(());
        }

        debug!(
            "Job {} progress {:.1}% ({})",
            self.job_id,
            snapshot.overall_percent,
            snapshot.current_step.as_deref().unwrap_or("-")
        );

        match self
            .store
            .update_progress(
                self.job_id,
                self.attempt_version,
                snapshot.overall_percent,
                snapshot.message.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Job {} is no longer held by this attempt", self.job_id);
                return Ok(());
            }
            Err(e) => warn!("Failed to persist progress for job {}: {}", self.job_id, e),
        }

        self.hub.publish(JobEvent::progress(self.job_id, &snapshot));
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, ProgressModel> {
        self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
