//! Bulk orchestrator
//!
//! Splits one logical job into named sub-units, each its own job record with
//! `parent_id` set to the bulk job. Sub-units are executed through the
//! scheduler with at most `concurrency_limit` running at once, in submission
//! order. A tracker subscribed to the hub keeps the composite status and
//! progress current and mirrors them onto the parent record, whose heartbeat
//! is refreshed for as long as the driver runs.
//!
//! Once every sub-unit is done, an optional finalize hook runs when at least
//! two sub-units succeeded. Its failure is reported on the bulk job but does
//! not change the composite status.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::domain::bulk::{
    BulkSnapshot, SubUnitState, composite_progress, composite_status,
};
use conveyor_core::domain::event::{EventPayload, JobEvent};
use conveyor_core::domain::job::{ErrorCode, Job, JobFailure, JobStatus, Priority, WorkSpec};
use conveyor_core::dto::job::SubmitJob;
use conveyor_store::{JobStore, StoreError};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError, SinkError, WorkError};
use crate::scheduler::JobScheduler;
use crate::service::hub::{NotificationHub, NotificationSink};
use crate::work::{WorkFunction, WorkRegistry};

/// Minimum number of successful sub-units before the finalize hook runs
const FINALIZE_MIN_SUCCESSES: usize = 2;

const MAX_CAS_ATTEMPTS: usize = 5;

/// One sub-unit to create under a bulk job
#[derive(Debug, Clone)]
pub struct SubUnitSpec {
    pub name: String,
    pub work: WorkSpec,
    /// Defaults to the bulk job's priority
    pub priority: Option<Priority>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

impl SubUnitSpec {
    pub fn new(name: impl Into<String>, work: WorkSpec) -> Self {
        Self {
            name: name.into(),
            work,
            priority: None,
            timeout_seconds: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Post-processing step combining sub-unit results
#[async_trait]
pub trait FinalizeHook: Send + Sync {
    async fn finalize(&self, snapshot: &BulkSnapshot) -> std::result::Result<Option<JsonValue>, WorkError>;
}

/// Handle to a running bulk job
pub struct BulkHandle {
    pub bulk_job_id: Uuid,
    /// Sub-unit job ids in submission order
    pub sub_unit_ids: Vec<Uuid>,
    driver: JoinHandle<Result<BulkSnapshot>>,
}

impl BulkHandle {
    /// Waits for every sub-unit and the finalize hook
    pub async fn wait(self) -> Result<BulkSnapshot> {
        self.driver
            .await
            .map_err(|e| SchedulerError::TaskFailed(e.to_string()))?
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Live composite view of one bulk job, fed by hub events of its sub-units
struct BulkTracker {
    snapshot: Mutex<BulkSnapshot>,
    /// job id -> index into `sub_units`
    index: HashMap<Uuid, usize>,
    hub: Weak<NotificationHub>,
    percent_tx: watch::Sender<f64>,
}

impl BulkTracker {
    fn new(
        snapshot: BulkSnapshot,
        hub: &Arc<NotificationHub>,
    ) -> (Self, watch::Receiver<f64>) {
        let index = snapshot
            .sub_units
            .iter()
            .enumerate()
            .map(|(i, unit)| (unit.job_id, i))
            .collect();
        let (percent_tx, percent_rx) = watch::channel(snapshot.progress_percent);
        let tracker = Self {
            snapshot: Mutex::new(snapshot),
            index,
            hub: Arc::downgrade(hub),
            percent_tx,
        };
        (tracker, percent_rx)
    }

    fn observer_id(bulk_job_id: Uuid) -> String {
        format!("bulk:{}", bulk_job_id)
    }

    fn snapshot(&self) -> BulkSnapshot {
        self.lock().clone()
    }

    fn status_of(&self, job_id: Uuid) -> Option<JobStatus> {
        let index = *self.index.get(&job_id)?;
        Some(self.lock().sub_units[index].status)
    }

    /// Applies a change to one sub-unit and republishes the composite view
    fn update_unit<F>(&self, job_id: Uuid, apply: F)
    where
        F: FnOnce(&mut SubUnitState),
    {
        let Some(&index) = self.index.get(&job_id) else {
            return;
        };
        let changed = {
            let mut snapshot = self.lock();
            let before = (snapshot.status, snapshot.progress_percent);
            apply(&mut snapshot.sub_units[index]);
            refresh(&mut snapshot);
            (before != (snapshot.status, snapshot.progress_percent)).then(|| snapshot.clone())
        };

        if let Some(snapshot) = changed {
            self.percent_tx.send_replace(snapshot.progress_percent);
            self.publish(&snapshot);
        }
    }

    /// Records the end state of a sub-unit as returned by the scheduler
    fn record(&self, job: &Job) {
        let job = job.clone();
        self.update_unit(job.id, move |unit| {
            unit.status = job.status;
            unit.progress_percent = job.progress_percent;
            unit.result_ref = job.result_ref;
        });
    }

    fn finish(&self, result_ref: Option<JsonValue>, error_message: Option<String>) -> BulkSnapshot {
        let snapshot = {
            let mut snapshot = self.lock();
            snapshot.finalized = true;
            snapshot.result_ref = result_ref;
            snapshot.error_message = error_message;
            snapshot.clone()
        };
        self.publish(&snapshot);
        snapshot
    }

    fn publish(&self, snapshot: &BulkSnapshot) {
        if let Some(hub) = self.hub.upgrade() {
            hub.publish(JobEvent::bulk(snapshot));
        }
    }

    fn lock(&self) -> MutexGuard<'_, BulkSnapshot> {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NotificationSink for BulkTracker {
    fn on_event(&self, job_id: Uuid, event: &JobEvent) -> std::result::Result<(), SinkError> {
        match &event.payload {
            EventPayload::Status {
                status,
                progress_percent,
                result_ref,
                ..
            } => {
                let (status, percent, result_ref) = (*status, *progress_percent, result_ref.clone());
                self.update_unit(job_id, move |unit| {
                    unit.status = status;
                    unit.progress_percent = percent;
                    unit.result_ref = result_ref;
                });
            }
            EventPayload::Progress { percent, .. } => {
                let percent = *percent;
                self.update_unit(job_id, move |unit| {
                    if !unit.status.is_finished() {
                        unit.progress_percent = percent;
                    }
                });
            }
            EventPayload::Retrying { .. } | EventPayload::Bulk { .. } => {}
        }
        Ok(())
    }
}

fn refresh(snapshot: &mut BulkSnapshot) {
    snapshot.status = composite_status(snapshot.sub_units.iter().map(|u| u.status));
    snapshot.progress_percent = composite_progress(snapshot.sub_units.iter().map(|u| u.progress_percent));
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Live trackers by bulk job id; a driver removes its own entry when done
type Trackers = Arc<Mutex<HashMap<Uuid, Arc<BulkTracker>>>>;

pub struct BulkOrchestrator {
    scheduler: Arc<JobScheduler>,
    registry: Arc<WorkRegistry>,
    trackers: Trackers,
}

impl BulkOrchestrator {
    pub fn new(scheduler: Arc<JobScheduler>, registry: Arc<WorkRegistry>) -> Self {
        Self {
            scheduler,
            registry,
            trackers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of bulk jobs this orchestrator is driving
    pub fn running_count(&self) -> usize {
        lock_trackers(&self.trackers).len()
    }

    /// Starts a bulk job
    ///
    /// `bulk_job_id` must be a Pending job submitted beforehand; it is claimed
    /// by this orchestrator and never handed to a worker pool. Its kind should
    /// therefore not be registered with any pool.
    pub async fn start(
        &self,
        bulk_job_id: Uuid,
        sub_units: Vec<SubUnitSpec>,
        concurrency_limit: usize,
        finalize: Option<Arc<dyn FinalizeHook>>,
    ) -> Result<BulkHandle> {
        let works = self.validate(&sub_units, concurrency_limit)?;
        if self.trackers().contains_key(&bulk_job_id) {
            return Err(SchedulerError::Validation(format!(
                "bulk job {} is already running",
                bulk_job_id
            )));
        }
        if !self.scheduler.is_ready() {
            return Err(SchedulerError::NotReady);
        }

        let parent = self.claim_parent(bulk_job_id).await?;

        let mut units = Vec::with_capacity(sub_units.len());
        for spec in sub_units {
            let request = SubmitJob {
                owner_id: parent.owner_id.clone(),
                priority: spec.priority.unwrap_or(parent.priority),
                timeout_seconds: spec.timeout_seconds,
                max_retries: spec.max_retries,
                work: spec.work,
                parent_id: Some(bulk_job_id),
                retry_on_timeout: true,
            };
            match self.scheduler.submit(request).await {
                Ok(job_id) => units.push(SubUnitState {
                    name: spec.name,
                    job_id,
                    status: JobStatus::Pending,
                    progress_percent: 0.0,
                    result_ref: None,
                }),
                Err(e) => {
                    error!("Bulk job {}: failed to submit sub-unit {}: {}", bulk_job_id, spec.name, e);
                    self.abort_start(bulk_job_id, &units, &e).await;
                    return Err(e);
                }
            }
        }

        let snapshot = BulkSnapshot {
            bulk_job_id,
            status: JobStatus::Pending,
            progress_percent: 0.0,
            concurrency_limit,
            sub_units: units,
            finalized: false,
            error_message: None,
            result_ref: None,
        };
        let sub_unit_ids: Vec<Uuid> = snapshot.sub_units.iter().map(|u| u.job_id).collect();

        let hub = Arc::clone(self.scheduler.hub());
        let (tracker, percent_rx) = BulkTracker::new(snapshot, &hub);
        let tracker = Arc::new(tracker);
        let observer_id = BulkTracker::observer_id(bulk_job_id);
        hub.register(observer_id.clone(), tracker.clone());
        for job_id in &sub_unit_ids {
            hub.subscribe(&observer_id, *job_id);
        }
        self.trackers().insert(bulk_job_id, Arc::clone(&tracker));

        info!(
            "Bulk job {} started with {} sub-unit(s), concurrency {}",
            bulk_job_id,
            sub_unit_ids.len(),
            concurrency_limit
        );

        let store = Arc::clone(self.scheduler.store());
        let mirror = tokio::spawn(mirror_progress(
            Arc::clone(&store),
            bulk_job_id,
            parent.version,
            percent_rx,
        ));
        let heartbeat = tokio::spawn(keep_alive(
            store,
            bulk_job_id,
            parent.version,
            self.scheduler.config().heartbeat_interval(),
        ));

        let driver = tokio::spawn(drive(
            Arc::clone(&self.scheduler),
            tracker,
            Arc::clone(&self.trackers),
            sub_unit_ids.iter().copied().zip(works).collect(),
            concurrency_limit,
            finalize,
            vec![mirror, heartbeat],
        ));

        Ok(BulkHandle {
            bulk_job_id,
            sub_unit_ids,
            driver,
        })
    }

    /// Composite view of a bulk job
    ///
    /// Bulk jobs driven by this process report their live state; others are
    /// rebuilt from the stored sub-unit records.
    pub async fn status(&self, bulk_job_id: Uuid) -> Result<BulkSnapshot> {
        if let Some(tracker) = self.trackers().get(&bulk_job_id) {
            return Ok(tracker.snapshot());
        }

        let store = self.scheduler.store();
        let parent = store.get(bulk_job_id).await?;
        let children = store.list_children(bulk_job_id).await?;
        Ok(reconstruct(&parent, &children))
    }

    /// Cancels every sub-unit that has not finished yet
    ///
    /// Returns the number of sub-units cancelled.
    pub async fn cancel(&self, bulk_job_id: Uuid, reason: &str) -> Result<usize> {
        let store = Arc::clone(self.scheduler.store());
        let parent = store.get(bulk_job_id).await?;
        let children = store.list_children(bulk_job_id).await?;

        let mut cancelled = 0;
        for child in children.iter().filter(|c| !c.status.is_finished()) {
            match self.scheduler.cancel(child.id, reason).await {
                Ok(_) => cancelled += 1,
                // Finished while we were iterating
                Err(SchedulerError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Bulk job {}: cancelled {} sub-unit(s)", bulk_job_id, cancelled);

        // Without a live driver nobody else will settle the parent record
        let live = self.trackers().contains_key(&bulk_job_id);
        if !live && !parent.status.is_finished() {
            let children = store.list_children(bulk_job_id).await?;
            let snapshot = reconstruct(&parent, &children);
            if snapshot.status.is_finished() {
                settle_parent(&self.scheduler, &snapshot).await?;
            }
        }
        Ok(cancelled)
    }

    // =========================================================================
    // Helper Functions
    // =========================================================================

    fn validate(
        &self,
        sub_units: &[SubUnitSpec],
        concurrency_limit: usize,
    ) -> Result<Vec<Arc<dyn WorkFunction>>> {
        if concurrency_limit == 0 {
            return Err(SchedulerError::Validation(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if sub_units.is_empty() {
            return Err(SchedulerError::Validation(
                "a bulk job needs at least one sub-unit".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut works = Vec::with_capacity(sub_units.len());
        for spec in sub_units {
            if spec.name.trim().is_empty() {
                return Err(SchedulerError::Validation("sub-unit name cannot be empty".to_string()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(SchedulerError::Validation(format!(
                    "duplicate sub-unit name '{}'",
                    spec.name
                )));
            }
            let work = self.registry.get(&spec.work.kind).ok_or_else(|| {
                SchedulerError::Validation(format!(
                    "no work function registered for kind '{}'",
                    spec.work.kind
                ))
            })?;
            works.push(work);
        }
        Ok(works)
    }

    async fn claim_parent(&self, bulk_job_id: Uuid) -> Result<Job> {
        let store = self.scheduler.store();
        let mut parent = store.get(bulk_job_id).await?;
        if parent.status != JobStatus::Pending {
            return Err(SchedulerError::InvalidState {
                id: bulk_job_id,
                status: parent.status,
            });
        }

        parent.mark_running(self.scheduler.worker_id(), Utc::now());
        let parent = match store.update(&parent).await {
            Ok(parent) => parent,
            Err(StoreError::StaleVersion(_)) => {
                let current = store.get(bulk_job_id).await?;
                return Err(SchedulerError::InvalidState {
                    id: bulk_job_id,
                    status: current.status,
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.scheduler.hub().publish(JobEvent::status(&parent));
        Ok(parent)
    }

    /// Rolls back a partially created bulk job
    async fn abort_start(&self, bulk_job_id: Uuid, created: &[SubUnitState], cause: &SchedulerError) {
        for unit in created {
            if let Err(e) = self.scheduler.cancel(unit.job_id, "bulk job failed to start").await {
                warn!("Failed to cancel sub-unit {} of bulk job {}: {}", unit.job_id, bulk_job_id, e);
            }
        }

        let failure = JobFailure::new(cause.code(), format!("bulk job failed to start: {}", cause));
        let store = self.scheduler.store();
        match store.get(bulk_job_id).await {
            Ok(mut parent) if parent.status == JobStatus::Running => {
                parent.mark_failed(JobStatus::Failed, failure, Utc::now());
                match store.update(&parent).await {
                    Ok(parent) => {
                        self.scheduler.hub().publish(JobEvent::status(&parent));
                    }
                    Err(e) => warn!("Failed to fail bulk job {}: {}", bulk_job_id, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load bulk job {}: {}", bulk_job_id, e),
        }
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<BulkTracker>>> {
        lock_trackers(&self.trackers)
    }
}

fn lock_trackers(trackers: &Trackers) -> MutexGuard<'_, HashMap<Uuid, Arc<BulkTracker>>> {
    trackers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Background Tasks
// =============================================================================

/// Runs the sub-units of one bulk job and settles the parent record
async fn drive(
    scheduler: Arc<JobScheduler>,
    tracker: Arc<BulkTracker>,
    trackers: Trackers,
    units: Vec<(Uuid, Arc<dyn WorkFunction>)>,
    concurrency_limit: usize,
    finalize: Option<Arc<dyn FinalizeHook>>,
    background: Vec<JoinHandle<()>>,
) -> Result<BulkSnapshot> {
    let bulk_job_id = tracker.snapshot().bulk_job_id;
    let semaphore = Arc::new(Semaphore::new(concurrency_limit));
    let mut tasks = JoinSet::new();

    // Permits are taken here, in submission order, so sub-units start FIFO
    for (job_id, work) in units {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if tracker.status_of(job_id).is_some_and(|s| s.is_finished()) {
            debug!("Bulk job {}: sub-unit {} already finished", bulk_job_id, job_id);
            continue;
        }

        let scheduler = Arc::clone(&scheduler);
        let tracker = Arc::clone(&tracker);
        tasks.spawn(async move {
            let _permit = permit;
            match scheduler.execute(job_id, work).await {
                Ok(outcome) => tracker.record(outcome.job()),
                Err(e) => {
                    error!("Bulk job {}: sub-unit {} could not run: {}", bulk_job_id, job_id, e);
                    if let Ok(job) = scheduler.get(job_id).await {
                        tracker.record(&job);
                    }
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Bulk job {}: sub-unit task failed: {}", bulk_job_id, e);
        }
    }

    let current = tracker.snapshot();
    let (result_ref, error_message) = match finalize {
        Some(hook)
            if current.status.is_finished()
                && current.successful_count() >= FINALIZE_MIN_SUCCESSES =>
        {
            match hook.finalize(&current).await {
                Ok(result_ref) => (result_ref, None),
                Err(e) => {
                    warn!("Bulk job {}: finalize failed: {}", bulk_job_id, e);
                    (None, Some(format!("finalize failed: {}", e)))
                }
            }
        }
        _ => (None, None),
    };
    let snapshot = tracker.finish(result_ref, error_message);

    scheduler.hub().disconnect(&BulkTracker::observer_id(bulk_job_id));
    for task in background {
        task.abort();
    }

    let settled = if snapshot.status.is_finished() {
        settle_parent(&scheduler, &snapshot).await
    } else {
        warn!(
            "Bulk job {} ended with sub-units still {}",
            bulk_job_id, snapshot.status
        );
        Ok(())
    };
    lock_trackers(&trackers).remove(&bulk_job_id);
    settled?;

    info!(
        "Bulk job {} finished as {} ({}/{} sub-units completed)",
        bulk_job_id,
        snapshot.status,
        snapshot.successful_count(),
        snapshot.sub_units.len()
    );
    Ok(snapshot)
}

/// Copies composite progress onto the parent record as it changes
async fn mirror_progress(
    store: Arc<dyn JobStore>,
    bulk_job_id: Uuid,
    version: i64,
    mut rx: watch::Receiver<f64>,
) {
    while rx.changed().await.is_ok() {
        let percent = *rx.borrow_and_update();
        if let Err(e) = store.update_progress(bulk_job_id, version, percent, None).await {
            warn!("Failed to persist progress for bulk job {}: {}", bulk_job_id, e);
        }
    }
}

/// Keeps the parent record out of orphan recovery while sub-units run
async fn keep_alive(store: Arc<dyn JobStore>, bulk_job_id: Uuid, version: i64, every: Duration) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match store.heartbeat(bulk_job_id, version).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Bulk job {} is no longer running, stopping heartbeat", bulk_job_id);
                return;
            }
            Err(e) => warn!("Failed to refresh heartbeat of bulk job {}: {}", bulk_job_id, e),
        }
    }
}

/// Writes the composite end state onto the parent record
async fn settle_parent(scheduler: &JobScheduler, snapshot: &BulkSnapshot) -> Result<()> {
    let store = scheduler.store();
    for _ in 0..MAX_CAS_ATTEMPTS {
        let mut parent = store.get(snapshot.bulk_job_id).await?;
        if parent.status.is_finished() {
            warn!(
                "Bulk job {} was already settled as {}, dropping composite {}",
                parent.id, parent.status, snapshot.status
            );
            return Ok(());
        }

        let now = Utc::now();
        match snapshot.status {
            JobStatus::Completed => parent.mark_completed(snapshot.result_ref.clone(), now),
            JobStatus::Cancelled => {
                parent.mark_cancelled("all unfinished sub-units were cancelled", now);
                parent.result_ref = snapshot.result_ref.clone();
            }
            _ => {
                let failed = snapshot
                    .sub_units
                    .iter()
                    .filter(|u| u.status.is_failure())
                    .count();
                let failure = JobFailure::new(
                    ErrorCode::TerminalWork,
                    format!("{} of {} sub-units failed", failed, snapshot.sub_units.len()),
                )
                .with_details(serde_json::json!({ "sub_units": snapshot.sub_unit_status() }));
                parent.mark_failed(JobStatus::Failed, failure, now);
                parent.result_ref = snapshot.result_ref.clone();
            }
        }
        parent.progress_percent = snapshot.progress_percent;
        if let Some(message) = &snapshot.error_message {
            parent.progress_message = Some(message.clone());
        }

        match store.update(&parent).await {
            Ok(parent) => {
                scheduler.hub().publish(JobEvent::status(&parent));
                return Ok(());
            }
            Err(StoreError::StaleVersion(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(StoreError::StaleVersion(snapshot.bulk_job_id).into())
}

/// Rebuilds a composite view from stored records
fn reconstruct(parent: &Job, children: &[Job]) -> BulkSnapshot {
    let sub_units = children
        .iter()
        .map(|child| SubUnitState {
            name: child.id.to_string(),
            job_id: child.id,
            status: child.status,
            progress_percent: child.progress_percent,
            result_ref: child.result_ref.clone(),
        })
        .collect();

    let mut snapshot = BulkSnapshot {
        bulk_job_id: parent.id,
        status: JobStatus::Pending,
        progress_percent: 0.0,
        concurrency_limit: 0,
        sub_units,
        finalized: parent.status.is_finished(),
        error_message: parent.progress_message.clone().filter(|_| parent.status.is_finished()),
        result_ref: parent.result_ref.clone(),
    };
    refresh(&mut snapshot);
    snapshot
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::work::from_fn;
    use conveyor_store::MemoryJobStore;

    async fn setup() -> (Arc<JobScheduler>, BulkOrchestrator) {
        let scheduler = Arc::new(JobScheduler::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(NotificationHub::default()),
            EngineConfig::new("bulk-test").with_retry_delays(vec![Duration::ZERO]),
        ));
        scheduler.recover_on_startup().await.unwrap();

        let mut registry = WorkRegistry::new();
        registry.register("convert", Arc::new(from_fn(|_ctx| async { Ok(None) })));
        let orchestrator = BulkOrchestrator::new(Arc::clone(&scheduler), Arc::new(registry));
        (scheduler, orchestrator)
    }

    async fn parent(scheduler: &JobScheduler) -> Uuid {
        scheduler
            .submit(SubmitJob::new("owner", WorkSpec::new("bundle", JsonValue::Null)))
            .await
            .unwrap()
    }

    fn unit(name: &str) -> SubUnitSpec {
        SubUnitSpec::new(name, WorkSpec::new("convert", serde_json::json!({ "format": name })))
    }

    #[tokio::test]
    async fn test_start_validates_input() {
        let (scheduler, orchestrator) = setup().await;
        let bulk = parent(&scheduler).await;

        let cases = vec![
            (vec![unit("pdf")], 0),
            (vec![], 2),
            (vec![unit("pdf"), unit("pdf")], 2),
            (
                vec![SubUnitSpec::new("x", WorkSpec::new("unknown", JsonValue::Null))],
                1,
            ),
        ];
        for (units, limit) in cases {
            assert!(matches!(
                orchestrator.start(bulk, units, limit, None).await,
                Err(SchedulerError::Validation(_))
            ));
        }

        // Nothing was claimed or created
        assert_eq!(scheduler.get(bulk).await.unwrap().status, JobStatus::Pending);
        assert!(scheduler.store().list_children(bulk).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_parent_must_be_pending() {
        let (scheduler, orchestrator) = setup().await;
        let bulk = parent(&scheduler).await;
        scheduler.cancel(bulk, "nope").await.unwrap();

        assert!(matches!(
            orchestrator.start(bulk, vec![unit("pdf")], 1, None).await,
            Err(SchedulerError::InvalidState { status: JobStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_sub_unit_rolls_back_the_start() {
        let (scheduler, orchestrator) = setup().await;
        let bulk = parent(&scheduler).await;

        // Passes orchestrator validation but is refused at submit
        let units = vec![unit("pdf"), unit("docx").with_timeout(1800)];
        assert!(matches!(
            orchestrator.start(bulk, units, 1, None).await,
            Err(SchedulerError::Validation(_))
        ));

        let stored = scheduler.get(bulk).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().message.contains("failed to start"));
        let children = scheduler.store().list_children(bulk).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, JobStatus::Cancelled);
        assert_eq!(orchestrator.running_count(), 0);
    }

    #[tokio::test]
    async fn test_reconstructed_status() {
        let (scheduler, orchestrator) = setup().await;
        let bulk = parent(&scheduler).await;
        let handle = orchestrator
            .start(bulk, vec![unit("pdf"), unit("docx")], 1, None)
            .await
            .unwrap();
        handle.wait().await.unwrap();
        // Finished drivers drop their tracker; status comes from the store
        assert_eq!(orchestrator.running_count(), 0);

        let snapshot = orchestrator.status(bulk).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.sub_units.len(), 2);
        assert_eq!(snapshot.sub_units[0].name, snapshot.sub_units[0].job_id.to_string());
        assert!(snapshot.finalized);
        assert_eq!(snapshot.progress_percent, 100.0);
    }

    #[test]
    fn test_tracker_follows_events() {
        let hub = Arc::new(NotificationHub::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let state = |name: &str, job_id| SubUnitState {
            name: name.to_string(),
            job_id,
            status: JobStatus::Pending,
            progress_percent: 0.0,
            result_ref: None,
        };
        let snapshot = BulkSnapshot {
            bulk_job_id: Uuid::new_v4(),
            status: JobStatus::Pending,
            progress_percent: 0.0,
            concurrency_limit: 2,
            sub_units: vec![state("a", a), state("b", b)],
            finalized: false,
            error_message: None,
            result_ref: None,
        };
        let (tracker, rx) = BulkTracker::new(snapshot, &hub);

        let mut job = Job::new("o", WorkSpec::new("convert", JsonValue::Null), Priority::Normal, 5, 0);
        job.id = a;
        job.mark_running("w", Utc::now());
        tracker.on_event(a, &JobEvent::status(&job)).unwrap();
        tracker
            .on_event(
                a,
                &JobEvent::new(
                    a,
                    EventPayload::Progress {
                        percent: 50.0,
                        step: None,
                        message: None,
                        estimated_remaining_secs: None,
                    },
                ),
            )
            .unwrap();

        let view = tracker.snapshot();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.progress_percent, 25.0);
        assert_eq!(*rx.borrow(), 25.0);

        // Events for unrelated jobs are ignored
        tracker.on_event(Uuid::new_v4(), &JobEvent::status(&job)).unwrap();
        assert_eq!(tracker.snapshot(), view);
    }
}
