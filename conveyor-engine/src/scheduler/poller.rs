//! Worker pool
//!
//! Polls the store for claimable jobs and executes them through the
//! scheduler. At most `max_parallel_jobs` attempts run at once; jobs beyond
//! that stay Pending until a later cycle.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::manager::{ExecutionOutcome, JobScheduler};
use crate::work::{WorkFunction, WorkRegistry};

/// Polls for and executes jobs of the registered kinds
pub struct WorkerPool {
    scheduler: Arc<JobScheduler>,
    registry: Arc<WorkRegistry>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<JobScheduler>, registry: Arc<WorkRegistry>) -> Self {
        let semaphore = Arc::new(Semaphore::new(scheduler.config().max_parallel_jobs));
        Self {
            scheduler,
            registry,
            semaphore,
            tasks: JoinSet::new(),
        }
    }

    /// Number of attempts currently running in this pool
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Runs startup recovery, then polls until `shutdown` fires
    ///
    /// On shutdown the scheduler is signalled and running attempts are
    /// awaited before returning.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        self.scheduler.recover_on_startup().await?;

        let config = self.scheduler.config();
        info!(
            "Starting worker pool {} (interval: {:?}, parallel: {}, kinds: {:?})",
            config.worker_id,
            config.poll_interval,
            config.max_parallel_jobs,
            self.registry.kinds()
        );

        let mut interval = time::interval(config.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            match self.poll_once().await {
                Ok(started) => {
                    if started > 0 {
                        info!("Started {} job(s) this cycle", started);
                    }
                }
                Err(e) => error!("Error during poll cycle: {}", e),
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Performs a single poll cycle, returning the number of jobs started
    pub async fn poll_once(&mut self) -> Result<usize> {
        self.reap();

        let available = self.semaphore.available_permits();
        if available == 0 {
            debug!("Max parallel jobs reached, skipping poll");
            return Ok(0);
        }

        let limit = available.min(self.scheduler.config().claim_batch_size);
        let jobs = self
            .scheduler
            .store()
            .list_claimable(&self.registry.kinds(), limit)
            .await?;

        if jobs.is_empty() {
            debug!("No jobs available");
            return Ok(0);
        }

        let mut started = 0;
        for job in jobs {
            let Some(work) = self.registry.get(&job.work.kind) else {
                continue;
            };

            // Try to acquire semaphore permit, skip if at max capacity
            match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => {
                    self.spawn_job_task(job.id, work, permit);
                    started += 1;
                }
                Err(_) => {
                    debug!("Max parallel jobs reached, leaving job {} queued", job.id);
                    break;
                }
            }
        }
        Ok(started)
    }

    /// Waits for every running attempt, signalling the scheduler first
    pub async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!("Waiting for {} running job(s) to stop", self.tasks.len());
        }
        self.scheduler.shutdown();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Job task panicked: {}", e);
            }
        }
    }

    fn spawn_job_task(&mut self, job_id: Uuid, work: Arc<dyn WorkFunction>, permit: OwnedSemaphorePermit) {
        let scheduler = Arc::clone(&self.scheduler);
        self.tasks.spawn(async move {
            let _permit = permit;
            match scheduler.execute(job_id, work).await {
                Ok(ExecutionOutcome::Finished(job)) => {
                    debug!("Job {} ended as {}", job_id, job.status)
                }
                Ok(ExecutionOutcome::Skipped(_)) => debug!("Job {} was taken by another worker", job_id),
                Ok(ExecutionOutcome::Superseded(job)) => {
                    debug!("Job {} was superseded (now {})", job_id, job.status)
                }
                Err(e) => error!("Failed to execute job {}: {}", job_id, e),
            }
            // Permit is released when dropped
        });
    }

    /// Collects finished tasks without waiting
    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                warn!("Job task panicked: {}", e);
            }
        }
    }
}
