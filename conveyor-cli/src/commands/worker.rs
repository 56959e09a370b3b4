//! Worker command
//!
//! Hosts a worker pool and the maintenance loop in this process.

use anyhow::{Context, Result};
use conveyor_engine::{MaintenanceLoop, WorkerPool};
use std::sync::Arc;
use tracing::info;

use super::{scheduler, shutdown_on_ctrl_c};
use crate::builtin;
use crate::config::Config;

pub async fn run_worker(config: &Config) -> Result<()> {
    let engine = config.engine()?;
    let store = config.connect().await?;
    info!(
        "Starting worker {} (parallel: {}, poll interval: {:?})",
        engine.worker_id, engine.max_parallel_jobs, engine.poll_interval
    );

    let shutdown = shutdown_on_ctrl_c();

    let maintenance = MaintenanceLoop::new(store.clone(), engine.clone());
    let maintenance_shutdown = shutdown.clone();
    let maintenance = tokio::spawn(async move { maintenance.run(maintenance_shutdown).await });

    let registry = Arc::new(builtin::registry());
    let pool = WorkerPool::new(scheduler(store, engine), registry);
    let result = pool.run(shutdown.clone()).await;

    shutdown.cancel();
    maintenance.await.context("Maintenance loop panicked")?;
    result.context("Worker pool failed")?;

    info!("Worker stopped");
    Ok(())
}
