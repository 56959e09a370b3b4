//! Notification hub
//!
//! Fans job events out to observers. Observers register a sink once and then
//! subscribe to individual jobs; the hub keeps a bounded history per job so a
//! late or reconnecting subscriber can catch up. Finished jobs keep their
//! history until more than `finished_job_limit` others finish after them.
//!
//! Delivery is best effort. A sink that fails is counted and skipped, and a
//! sink reporting [`SinkError::Closed`] is removed along with its
//! subscriptions. Publishing itself never fails.

use conveyor_core::domain::event::{EventPayload, JobEvent};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SinkError;

/// Finished jobs whose history is retained by default
pub const DEFAULT_FINISHED_JOB_LIMIT: usize = 1000;

/// Receives events for the jobs its observer subscribed to
///
/// Implementations must not block: the hub calls them inline while
/// publishing.
pub trait NotificationSink: Send + Sync {
    fn on_event(&self, job_id: Uuid, event: &JobEvent) -> Result<(), SinkError>;
}

/// Sink that forwards events into a bounded channel
///
/// Suits stream transports (websocket, SSE) that drain the receiver from
/// their own task.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn on_event(&self, _job_id: Uuid, event: &JobEvent) -> Result<(), SinkError> {
        self.tx.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Hub counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Observers with at least one subscription
    pub subscriber_count: usize,
    /// Jobs with at least one subscriber
    pub active_job_count: usize,
    pub total_subscriptions: usize,
    pub failed_deliveries: u64,
}

#[derive(Default)]
struct HubState {
    sinks: HashMap<String, Arc<dyn NotificationSink>>,
    /// job id -> observer ids
    subscriptions: HashMap<Uuid, HashSet<String>>,
    history: HashMap<Uuid, VecDeque<JobEvent>>,
    /// Finished jobs, oldest first
    finished: VecDeque<Uuid>,
}

impl HubState {
    /// Tracks whether a status event leaves the job finished, evicting the
    /// oldest finished jobs beyond `limit`
    fn track_finished(&mut self, event: &JobEvent, limit: usize) {
        let EventPayload::Status { status, .. } = &event.payload else {
            return;
        };
        self.finished.retain(|id| *id != event.job_id);
        if !status.is_finished() {
            return;
        }
        self.finished.push_back(event.job_id);
        while self.finished.len() > limit {
            if let Some(expired) = self.finished.pop_front() {
                self.history.remove(&expired);
                self.subscriptions.remove(&expired);
            }
        }
    }

    fn remove_observer(&mut self, observer_id: &str) {
        self.sinks.remove(observer_id);
        self.subscriptions.retain(|_, observers| {
            observers.remove(observer_id);
            !observers.is_empty()
        });
    }
}

pub struct NotificationHub {
    state: RwLock<HubState>,
    history_limit: usize,
    finished_job_limit: usize,
    failed_deliveries: AtomicU64,
}

impl NotificationHub {
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            history_limit,
            finished_job_limit: DEFAULT_FINISHED_JOB_LIMIT,
            failed_deliveries: AtomicU64::new(0),
        }
    }

    pub fn with_finished_job_limit(mut self, limit: usize) -> Self {
        self.finished_job_limit = limit;
        self
    }

    /// Registers (or replaces) the sink of an observer
    pub fn register(&self, observer_id: impl Into<String>, sink: Arc<dyn NotificationSink>) {
        let observer_id = observer_id.into();
        debug!("Observer {} registered", observer_id);
        self.write().sinks.insert(observer_id, sink);
    }

    /// Subscribes an observer to a job and replays that job's history to it
    ///
    /// Returns the number of events replayed.
    pub fn subscribe(&self, observer_id: &str, job_id: Uuid) -> usize {
        let (sink, backlog) = {
            let mut state = self.write();
            state
                .subscriptions
                .entry(job_id)
                .or_default()
                .insert(observer_id.to_string());
            let backlog: Vec<JobEvent> = state
                .history
                .get(&job_id)
                .map(|events| events.iter().cloned().collect())
                .unwrap_or_default();
            (state.sinks.get(observer_id).cloned(), backlog)
        };

        let Some(sink) = sink else {
            return 0;
        };
        let mut replayed = 0;
        for event in &backlog {
            match sink.on_event(job_id, event) {
                Ok(()) => replayed += 1,
                Err(e) => {
                    self.record_failure(observer_id, job_id, &e);
                    break;
                }
            }
        }
        replayed
    }

    pub fn unsubscribe(&self, observer_id: &str, job_id: Uuid) {
        let mut state = self.write();
        if let Some(observers) = state.subscriptions.get_mut(&job_id) {
            observers.remove(observer_id);
            if observers.is_empty() {
                state.subscriptions.remove(&job_id);
            }
        }
    }

    /// Removes an observer's sink and every subscription it holds
    pub fn disconnect(&self, observer_id: &str) {
        self.write().remove_observer(observer_id);
        debug!("Observer {} disconnected", observer_id);
    }

    /// Records an event and delivers it to the job's subscribers
    ///
    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, event: JobEvent) -> usize {
        let job_id = event.job_id;
        let targets: Vec<(String, Arc<dyn NotificationSink>)> = {
            let mut state = self.write();
            let history = state.history.entry(job_id).or_default();
            history.push_back(event.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }

            let targets = match state.subscriptions.get(&job_id) {
                Some(observers) => observers
                    .iter()
                    .filter_map(|o| state.sinks.get(o).map(|s| (o.clone(), Arc::clone(s))))
                    .collect(),
                None => Vec::new(),
            };
            state.track_finished(&event, self.finished_job_limit);
            targets
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (observer_id, sink) in targets {
            match sink.on_event(job_id, &event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    if e == SinkError::Closed {
                        closed.push(observer_id.clone());
                    }
                    self.record_failure(&observer_id, job_id, &e);
                }
            }
        }

        if !closed.is_empty() {
            let mut state = self.write();
            for observer_id in closed {
                state.remove_observer(&observer_id);
            }
        }
        delivered
    }

    /// Events kept for a job, oldest first
    pub fn history(&self, job_id: Uuid) -> Vec<JobEvent> {
        self.read()
            .history
            .get(&job_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets a job's history and subscriptions
    pub fn clear_job(&self, job_id: Uuid) {
        let mut state = self.write();
        state.history.remove(&job_id);
        state.subscriptions.remove(&job_id);
        state.finished.retain(|id| *id != job_id);
    }

    /// Number of jobs with retained history
    pub fn tracked_job_count(&self) -> usize {
        self.read().history.len()
    }

    pub fn stats(&self) -> HubStats {
        let state = self.read();
        let observers: HashSet<&String> = state.subscriptions.values().flatten().collect();
        HubStats {
            subscriber_count: observers.len(),
            active_job_count: state.subscriptions.len(),
            total_subscriptions: state.subscriptions.values().map(HashSet::len).sum(),
            failed_deliveries: self.failed_deliveries.load(Ordering::Relaxed),
        }
    }

    fn record_failure(&self, observer_id: &str, job_id: Uuid, error: &SinkError) {
        self.failed_deliveries.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Failed to deliver event for job {} to observer {}: {}",
            job_id, observer_id, error
        );
    }

    fn read(&self) -> RwLockReadGuard<'_, HubState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::domain::job::{Job, JobStatus, Priority, WorkSpec};

    struct BrokenSink;

    impl NotificationSink for BrokenSink {
        fn on_event(&self, _job_id: Uuid, _event: &JobEvent) -> Result<(), SinkError> {
            Err(SinkError::Other("socket reset".to_string()))
        }
    }

    fn status(job_id: Uuid, status: JobStatus) -> JobEvent {
        let mut job = Job::new("o", WorkSpec::new("export", serde_json::Value::Null), Priority::Normal, 60, 0);
        job.id = job_id;
        job.status = status;
        JobEvent::status(&job)
    }

    fn progress(job_id: Uuid, percent: f64) -> JobEvent {
        JobEvent::new(
            job_id,
            EventPayload::Progress {
                percent,
                step: None,
                message: None,
                estimated_remaining_secs: None,
            },
        )
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let hub = NotificationHub::default();
        let job_id = Uuid::new_v4();
        let (sink, mut rx) = ChannelSink::new(8);
        hub.register("broken", Arc::new(BrokenSink));
        hub.register("browser", Arc::new(sink));
        hub.subscribe("broken", job_id);
        hub.subscribe("browser", job_id);

        assert_eq!(hub.publish(progress(job_id, 10.0)), 1);
        assert!(rx.try_recv().is_ok());
        assert_eq!(hub.stats().failed_deliveries, 1);
    }

    #[test]
    fn test_history_is_bounded_and_replayed() {
        let hub = NotificationHub::new(50);
        let job_id = Uuid::new_v4();
        for i in 0..60 {
            hub.publish(progress(job_id, i as f64));
        }
        let history = hub.history(job_id);
        assert_eq!(history.len(), 50);
        assert!(matches!(
            history[0].payload,
            EventPayload::Progress { percent, .. } if percent == 10.0
        ));

        let (sink, mut rx) = ChannelSink::new(64);
        hub.register("late", Arc::new(sink));
        assert_eq!(hub.subscribe("late", job_id), 50);
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 50);
    }

    #[test]
    fn test_closed_sink_is_dropped() {
        let hub = NotificationHub::default();
        let job_id = Uuid::new_v4();
        let (sink, rx) = ChannelSink::new(1);
        hub.register("tab", Arc::new(sink));
        hub.subscribe("tab", job_id);
        drop(rx);

        assert_eq!(hub.publish(progress(job_id, 1.0)), 0);
        let stats = hub.stats();
        assert_eq!(stats.total_subscriptions, 0);
        assert_eq!(stats.subscriber_count, 0);
    }

    #[test]
    fn test_stats_and_unsubscribe() {
        let hub = NotificationHub::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        hub.subscribe("alice", a);
        hub.subscribe("alice", b);
        hub.subscribe("bob", a);

        let stats = hub.stats();
        assert_eq!(stats.subscriber_count, 2);
        assert_eq!(stats.active_job_count, 2);
        assert_eq!(stats.total_subscriptions, 3);

        hub.unsubscribe("alice", b);
        assert_eq!(hub.stats().active_job_count, 1);

        hub.disconnect("bob");
        let stats = hub.stats();
        assert_eq!(stats.subscriber_count, 1);
        assert_eq!(stats.total_subscriptions, 1);

        hub.publish(progress(a, 5.0));
        hub.clear_job(a);
        assert!(hub.history(a).is_empty());
        assert_eq!(hub.stats().total_subscriptions, 0);
    }

    #[test]
    fn test_finished_job_history_is_evicted() {
        let hub = NotificationHub::default().with_finished_job_limit(2);
        let jobs: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let running = Uuid::new_v4();
        hub.subscribe("alice", jobs[0]);
        hub.publish(status(running, JobStatus::Running));

        for id in &jobs {
            hub.publish(status(*id, JobStatus::Running));
            hub.publish(progress(*id, 50.0));
            hub.publish(status(*id, JobStatus::Completed));
        }

        assert!(hub.history(jobs[0]).is_empty());
        assert_eq!(hub.history(jobs[2]).len(), 3);
        assert_eq!(hub.tracked_job_count(), 3);
        assert_eq!(hub.stats().total_subscriptions, 0);

        // A manual retry makes a job live again
        hub.publish(status(jobs[1], JobStatus::Pending));
        hub.publish(status(Uuid::new_v4(), JobStatus::Cancelled));
        assert_eq!(hub.history(jobs[1]).len(), 4);
        assert!(!hub.history(running).is_empty());
    }
}
