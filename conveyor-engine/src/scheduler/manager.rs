//! Job scheduler
//!
//! Owns the job state machine:
//!
//! ```text
//! Pending -> Running -> Completed | Failed | TimedOut | Cancelled
//! Running -> Running             (automatic retry after backoff)
//! Failed | TimedOut -> Pending   (manual retry, while retry_count < max_retries)
//! ```
//!
//! Every transition is a compare-and-swap on the record version, so several
//! workers can share one store. An attempt is identified by the version it
//! claimed the record at; once another actor (a cancel, orphan recovery)
//! bumps it, the attempt stops touching the record.

use chrono::Utc;
use conveyor_core::domain::event::JobEvent;
use conveyor_core::domain::job::{ErrorCode, Job, JobFailure, JobStatus};
use conveyor_core::domain::progress::ProgressModel;
use conveyor_core::dto::job::{OwnerJobsQuery, SubmitJob};
use conveyor_core::dto::stats::{HealthMetrics, JobStatistics};
use conveyor_store::{JobStore, StoreError};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Result, SchedulerError};
use crate::service::{NotificationHub, ProgressReporter};
use crate::work::{WorkContext, WorkFunction};

/// Attempts at a read-modify-write before giving up on a contended record
const MAX_CAS_ATTEMPTS: usize = 5;

/// How a call to [`JobScheduler::execute`] ended
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The job reached an end state under this worker
    Finished(Job),
    /// The job was not Pending, or another worker claimed it first
    Skipped(Job),
    /// Another actor took the record over mid-attempt (cancel, orphan recovery)
    Superseded(Job),
}

impl ExecutionOutcome {
    pub fn job(&self) -> &Job {
        match self {
            ExecutionOutcome::Finished(job)
            | ExecutionOutcome::Skipped(job)
            | ExecutionOutcome::Superseded(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            ExecutionOutcome::Finished(job)
            | ExecutionOutcome::Skipped(job)
            | ExecutionOutcome::Superseded(job) => job,
        }
    }
}

/// Why an attempt did not complete
struct AttemptFailure {
    status: JobStatus,
    failure: JobFailure,
    retryable: bool,
}

pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    config: EngineConfig,
    /// Cancellation tokens of the attempts this process is awaiting
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    recovery: OnceCell<u64>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<NotificationHub>, config: EngineConfig) -> Self {
        Self {
            store,
            hub,
            config,
            in_flight: Mutex::new(HashMap::new()),
            recovery: OnceCell::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Token cancelled by [`JobScheduler::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals running attempts and backoff sleeps to stop
    pub fn shutdown(&self) {
        info!("Scheduler {} shutting down", self.config.worker_id);
        self.shutdown.cancel();
    }

    pub fn is_ready(&self) -> bool {
        self.recovery.initialized()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    // =========================================================================
    // Submission and queries
    // =========================================================================

    /// Validates and persists a new Pending job
    pub async fn submit(&self, req: SubmitJob) -> Result<Uuid> {
        validate_submission(&req, &self.config)?;

        let timeout_seconds = req
            .timeout_seconds
            .unwrap_or(self.config.default_job_timeout.as_secs());
        let max_retries = req.max_retries.unwrap_or(self.config.default_max_retries);

        let mut job = Job::new(req.owner_id, req.work, req.priority, timeout_seconds, max_retries)
            .with_retry_on_timeout(req.retry_on_timeout);
        if let Some(parent_id) = req.parent_id {
            job = job.with_parent(parent_id);
        }

        let job = self.store.create(&job).await?;
        info!(
            "Job {} submitted ({}, priority {}, owner {})",
            job.id, job.work.kind, job.priority, job.owner_id
        );
        self.publish_status(&job);
        Ok(job.id)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Job> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn list_by_owner(&self, owner_id: &str, query: &OwnerJobsQuery) -> Result<Vec<Job>> {
        Ok(self.store.list_by_owner(owner_id, query).await?)
    }

    pub async fn statistics(&self, window: Duration) -> Result<JobStatistics> {
        Ok(self.store.statistics(window).await?)
    }

    /// Queue health as seen from this worker
    pub async fn health_metrics(&self, window: Duration) -> Result<HealthMetrics> {
        let stats = self.store.statistics(window).await?;
        let worker_running_count = self
            .store
            .running_count_for_worker(&self.config.worker_id)
            .await?;

        Ok(HealthMetrics {
            total_pending: stats.pending_by_priority.values().sum(),
            queue_depth: stats.pending_by_priority,
            running_count: stats.running_count,
            failure_rate: stats.failure_rate,
            oldest_pending_age_secs: stats.oldest_pending_age_secs,
            worker_id: self.config.worker_id.clone(),
            worker_running_count,
            in_flight: self.in_flight_count(),
        })
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Fails jobs orphaned by a previous crash; runs once per scheduler
    ///
    /// [`JobScheduler::execute`] is refused until this has completed.
    pub async fn recover_on_startup(&self) -> Result<u64> {
        let recovered = self
            .recovery
            .get_or_try_init(|| async {
                let count = self.store.recover_orphaned(self.config.orphan_timeout).await?;
                info!(
                    "Startup recovery finished for worker {}: {} orphaned job(s)",
                    self.config.worker_id, count
                );
                Ok::<u64, SchedulerError>(count)
            })
            .await?;
        Ok(*recovered)
    }

    /// Cancels a Pending or Running job
    ///
    /// Cancellation is recorded on the job; a running work function is
    /// signalled through its token and is expected to stop on its own. A job
    /// waiting out a retry backoff is Running and is cancelled the same way.
    pub async fn cancel(&self, job_id: Uuid, reason: &str) -> Result<Job> {
        let job = self
            .transition(job_id, |job| match job.status {
                JobStatus::Pending | JobStatus::Running => {
                    job.mark_cancelled(reason, Utc::now());
                    Ok(())
                }
                JobStatus::Completed
                | JobStatus::Failed
                | JobStatus::Cancelled
                | JobStatus::TimedOut => Err(SchedulerError::InvalidState {
                    id: job.id,
                    status: job.status,
                }),
            })
            .await?;

        if let Some(token) = self.in_flight().get(&job_id) {
            token.cancel();
        }
        info!("Job {} cancelled: {}", job_id, reason);
        self.publish_status(&job);
        Ok(job)
    }

    /// Returns a Failed or TimedOut job to Pending, consuming one retry
    pub async fn retry(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .transition(job_id, |job| match job.status {
                JobStatus::Failed | JobStatus::TimedOut => {
                    if !job.can_retry() {
                        return Err(SchedulerError::RetriesExhausted {
                            id: job.id,
                            retry_count: job.retry_count,
                            max_retries: job.max_retries,
                        });
                    }
                    job.reset_for_retry();
                    Ok(())
                }
                JobStatus::Pending
                | JobStatus::Running
                | JobStatus::Completed
                | JobStatus::Cancelled => Err(SchedulerError::InvalidState {
                    id: job.id,
                    status: job.status,
                }),
            })
            .await?;

        info!("Job {} queued for retry {}", job_id, job.retry_count);
        self.publish_status(&job);
        Ok(job)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Runs a Pending job to an end state, retrying with backoff
    ///
    /// Failures of the work are recorded on the job. An `Err` means the
    /// scheduler could not read or persist the record.
    pub async fn execute(&self, job_id: Uuid, work: Arc<dyn WorkFunction>) -> Result<ExecutionOutcome> {
        if !self.is_ready() {
            return Err(SchedulerError::NotReady);
        }

        let mut job = self.store.get(job_id).await?;
        if job.status != JobStatus::Pending {
            debug!("Job {} is {}, not executing", job_id, job.status);
            return Ok(ExecutionOutcome::Skipped(job));
        }

        let mut first_attempt = true;
        loop {
            // Claim
            job.mark_running(&self.config.worker_id, Utc::now());
            job = match self.store.update(&job).await {
                Ok(job) => job,
                Err(StoreError::StaleVersion(_)) if first_attempt => {
                    debug!("Job {} was claimed elsewhere", job_id);
                    return Ok(ExecutionOutcome::Skipped(self.store.get(job_id).await?));
                }
                Err(StoreError::StaleVersion(_)) => return self.superseded(job_id).await,
                Err(e) => return Err(e.into()),
            };
            first_attempt = false;
            info!(
                "Job {} started on worker {} (attempt {})",
                job_id,
                self.config.worker_id,
                job.retry_count + 1
            );
            self.publish_status(&job);

            let attempt = self.run_attempt(&job, Arc::clone(&work)).await;

            let current = self.store.get(job_id).await?;
            if current.version != job.version || !current.is_owned_by(&self.config.worker_id) {
                info!(
                    "Job {} was taken over while running (now {})",
                    job_id, current.status
                );
                return Ok(ExecutionOutcome::Superseded(current));
            }
            job = current;

            let failure = match attempt {
                Ok(result_ref) => {
                    job.mark_completed(result_ref, Utc::now());
                    let Some(job) = self.save(&job).await? else {
                        return self.superseded(job_id).await;
                    };
                    info!("Job {} completed", job_id);
                    self.publish_status(&job);
                    return Ok(ExecutionOutcome::Finished(job));
                }
                Err(failure) => failure,
            };

            if !failure.retryable || !job.can_retry() {
                job.mark_failed(failure.status, failure.failure, Utc::now());
                let Some(job) = self.save(&job).await? else {
                    return self.superseded(job_id).await;
                };
                warn!(
                    "Job {} finished as {} after {} attempt(s)",
                    job_id,
                    job.status,
                    job.retry_count + 1
                );
                self.publish_status(&job);
                return Ok(ExecutionOutcome::Finished(job));
            }

            // The record stays Running under this worker during the backoff,
            // so it is neither final nor claimable, and can still be cancelled
            let delay = self.config.retry_delay(job.retry_count);
            job.mark_retrying(failure.failure.clone(), Utc::now());
            let Some(saved) = self.save(&job).await? else {
                return self.superseded(job_id).await;
            };
            job = saved;
            self.hub.publish(JobEvent::retrying(
                job_id,
                job.retry_count + 2,
                delay,
                failure.failure.clone(),
            ));
            info!(
                "Job {} failed as {}, retrying in {:?} ({}/{})",
                job_id,
                failure.status,
                delay,
                job.retry_count + 1,
                job.max_retries
            );

            let token = self.shutdown.child_token();
            self.in_flight().insert(job_id, token.clone());
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = token.cancelled() => true,
            };
            self.in_flight().remove(&job_id);

            if interrupted {
                if !self.shutdown.is_cancelled() {
                    // Cancelled through `cancel`, which already owns the record
                    return self.superseded(job_id).await;
                }
                info!("Shutdown during backoff, failing job {} as {}", job_id, failure.status);
                job.mark_failed(failure.status, failure.failure, Utc::now());
                let Some(job) = self.save(&job).await? else {
                    return self.superseded(job_id).await;
                };
                self.publish_status(&job);
                return Ok(ExecutionOutcome::Finished(job));
            }

            job.retry_count += 1;
        }
    }

    /// Runs the work function once under the job's timeout
    async fn run_attempt(
        &self,
        job: &Job,
        work: Arc<dyn WorkFunction>,
    ) -> std::result::Result<Option<JsonValue>, AttemptFailure> {
        let model = match ProgressModel::new(work.steps(job)) {
            Ok(model) => model,
            Err(e) => {
                return Err(AttemptFailure {
                    status: JobStatus::Failed,
                    failure: JobFailure::new(ErrorCode::Validation, e.to_string()),
                    retryable: false,
                });
            }
        };

        let token = self.shutdown.child_token();
        self.in_flight().insert(job.id, token.clone());

        let ctx = WorkContext {
            job: job.clone(),
            progress: ProgressReporter::new(
                job,
                model,
                Arc::clone(&self.store),
                Arc::clone(&self.hub),
                token.clone(),
            ),
            cancel: token.clone(),
        };

        let mut handle = tokio::spawn(async move { work.run(ctx).await });
        let timeout = Duration::from_secs(job.timeout_seconds);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, &mut handle) => Some(outcome),
            _ = token.cancelled() => None,
        };

        self.in_flight().remove(&job.id);
        // Ends the attempt for anything the work left running
        token.cancel();

        let Some(outcome) = outcome else {
            // Cancelled or shutting down; the work is left to wind down on
            // its own.
            return Err(AttemptFailure {
                status: JobStatus::Failed,
                failure: JobFailure::new(ErrorCode::Cancelled, "attempt interrupted"),
                retryable: false,
            });
        };

        match outcome {
            Ok(Ok(Ok(result_ref))) => Ok(result_ref),
            Ok(Ok(Err(e))) => {
                debug!("Job {} attempt failed: {}", job.id, e);
                Err(AttemptFailure {
                    status: JobStatus::Failed,
                    failure: e.to_failure(),
                    retryable: e.is_retryable(),
                })
            }
            Ok(Err(join_error)) => {
                error!("Work function for job {} panicked: {}", job.id, join_error);
                Err(AttemptFailure {
                    status: JobStatus::Failed,
                    failure: JobFailure::new(
                        ErrorCode::TerminalWork,
                        format!("work function aborted: {}", join_error),
                    ),
                    retryable: false,
                })
            }
            Err(_elapsed) => {
                // The task keeps running detached; it only learns about the
                // timeout through its token.
                warn!(
                    "Job {} exceeded its {}s timeout",
                    job.id, job.timeout_seconds
                );
                Err(AttemptFailure {
                    status: JobStatus::TimedOut,
                    failure: JobFailure::new(
                        ErrorCode::Timeout,
                        format!("attempt exceeded {}s timeout", job.timeout_seconds),
                    ),
                    retryable: job.retry_on_timeout,
                })
            }
        }
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    /// Persists a transition made by the owning attempt
    ///
    /// Returns `None` when the record changed underneath; storage failures
    /// are surfaced to the caller, never treated as success.
    async fn save(&self, job: &Job) -> Result<Option<Job>> {
        match self.store.update(job).await {
            Ok(job) => Ok(Some(job)),
            Err(StoreError::StaleVersion(_)) => Ok(None),
            Err(e) => {
                error!(
                    "Failed to persist {} state of job {}: {}",
                    job.status, job.id, e
                );
                Err(e.into())
            }
        }
    }

    async fn superseded(&self, job_id: Uuid) -> Result<ExecutionOutcome> {
        let current = self.store.get(job_id).await?;
        info!("Job {} was changed by another actor (now {})", job_id, current.status);
        Ok(ExecutionOutcome::Superseded(current))
    }

    /// Read-modify-write with retries on version conflicts
    async fn transition<F>(&self, job_id: Uuid, mut apply: F) -> Result<Job>
    where
        F: FnMut(&mut Job) -> Result<()>,
    {
        let mut last_error = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self.store.get(job_id).await?;
            apply(&mut job)?;
            match self.store.update(&job).await {
                Ok(job) => return Ok(job),
                Err(StoreError::StaleVersion(id)) => {
                    debug!("Job {} changed concurrently, re-reading", id);
                    last_error = Some(StoreError::StaleVersion(id));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_error
            .unwrap_or(StoreError::StaleVersion(job_id))
            .into())
    }

    fn publish_status(&self, job: &Job) {
        self.hub.publish(JobEvent::status(job));
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_submission(req: &SubmitJob, config: &EngineConfig) -> Result<()> {
    if req.owner_id.trim().is_empty() {
        return Err(SchedulerError::Validation("owner_id cannot be empty".to_string()));
    }
    if req.work.kind.trim().is_empty() {
        return Err(SchedulerError::Validation("work kind cannot be empty".to_string()));
    }
    if req.timeout_seconds == Some(0) {
        return Err(SchedulerError::Validation(
            "timeout_seconds must be greater than 0".to_string(),
        ));
    }
    // A longer attempt would be failed as orphaned while still running
    let orphan_secs = config.orphan_timeout.as_secs();
    if req.timeout_seconds.is_some_and(|t| t >= orphan_secs) {
        return Err(SchedulerError::Validation(format!(
            "timeout_seconds must be less than the orphan timeout ({}s)",
            orphan_secs
        )));
    }
    Ok(())
}
