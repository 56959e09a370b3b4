//! Maintenance loop
//!
//! Periodically fails orphaned Running jobs and deletes old finished ones.

use conveyor_store::{JobStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::EngineConfig;

/// What one maintenance pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub recovered: u64,
    pub cleaned: u64,
}

pub struct MaintenanceLoop {
    store: Arc<dyn JobStore>,
    config: EngineConfig,
}

impl MaintenanceLoop {
    pub fn new(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Runs a pass every `cleanup_interval` until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting maintenance loop (interval: {:?}, max age: {:?})",
            self.config.cleanup_interval, self.config.cleanup_max_age
        );

        let mut interval = time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("Maintenance loop stopped");
                    return;
                }
            }

            if let Err(e) = self.run_once().await {
                error!("Maintenance pass failed: {}", e);
            }
        }
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport, StoreError> {
        let recovered = self.store.recover_orphaned(self.config.orphan_timeout).await?;
        let cleaned = self
            .store
            .cleanup_older_than(self.config.cleanup_max_age, &[])
            .await?;

        if recovered > 0 || cleaned > 0 {
            info!(
                "Maintenance: {} orphaned job(s) failed, {} old job(s) deleted",
                recovered, cleaned
            );
        }
        Ok(MaintenanceReport { recovered, cleaned })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use conveyor_core::domain::job::{ErrorCode, Job, JobStatus, Priority, WorkSpec};
    use conveyor_store::MemoryJobStore;

    fn job() -> Job {
        Job::new("o", WorkSpec::new("export", serde_json::Value::Null), Priority::Normal, 60, 0)
    }

    #[tokio::test]
    async fn test_run_once_recovers_and_cleans() {
        let store = Arc::new(MemoryJobStore::new());
        let config = EngineConfig::new("maint");

        let mut stuck = job();
        stuck.mark_running("gone", Utc::now() - ChronoDuration::hours(2));
        store.create(&stuck).await.unwrap();

        let mut old = job();
        old.mark_running("w", Utc::now() - ChronoDuration::days(30));
        old.mark_completed(None, Utc::now() - ChronoDuration::days(30));
        store.create(&old).await.unwrap();

        let fresh = job();
        store.create(&fresh).await.unwrap();

        let maintenance = MaintenanceLoop::new(store.clone(), config);
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report, MaintenanceReport { recovered: 1, cleaned: 1 });

        let stuck = store.get(stuck.id).await.unwrap();
        assert_eq!(stuck.status, JobStatus::Failed);
        assert_eq!(stuck.error.map(|e| e.code), Some(ErrorCode::Orphaned));
        assert!(store.get(old.id).await.is_err());
        assert_eq!(store.get(fresh.id).await.unwrap().status, JobStatus::Pending);

        // Second pass has nothing left to do
        assert_eq!(maintenance.run_once().await.unwrap(), MaintenanceReport::default());
    }
}
