//! Scheduler behaviour that must hold on every store backend

mod common;

use conveyor_core::domain::job::{JobStatus, WorkSpec};
use conveyor_core::dto::job::SubmitJob;
use conveyor_engine::{
    BulkOrchestrator, EngineConfig, ExecutionOutcome, JobScheduler, NotificationHub, SubUnitSpec,
    WorkError, WorkRegistry, from_fn,
};
use conveyor_store::JobStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn scheduler_on(store: Arc<dyn JobStore>) -> Arc<JobScheduler> {
    let scheduler = Arc::new(JobScheduler::new(
        store,
        Arc::new(NotificationHub::default()),
        EngineConfig::new("contract-worker").with_retry_delays(vec![Duration::ZERO]),
    ));
    scheduler.recover_on_startup().await.unwrap();
    scheduler
}

fn request(kind: &str) -> SubmitJob {
    SubmitJob::new("owner-1", WorkSpec::new(kind, serde_json::Value::Null))
}

#[tokio::test(start_paused = true)]
async fn test_successful_attempt_finishes_the_job() {
    for (name, store) in common::stores() {
        let scheduler = scheduler_on(Arc::clone(&store)).await;
        let id = scheduler.submit(request("export")).await.unwrap();

        let work = from_fn(|ctx| async move {
            ctx.progress.update_step("execute", 40.0, None).await.ok();
            Ok(Some(json!("out/report.pdf")))
        });
        let outcome = scheduler.execute(id, Arc::new(work)).await.unwrap();
        assert!(
            matches!(outcome, ExecutionOutcome::Finished(ref job) if job.status == JobStatus::Completed),
            "{}: {:?}",
            name,
            outcome
        );

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed, "{}", name);
        assert_eq!(stored.result_ref, Some(json!("out/report.pdf")), "{}", name);
        assert_eq!(stored.progress_percent, 100.0, "{}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retried_attempt_finishes_the_job() {
    for (name, store) in common::stores() {
        let scheduler = scheduler_on(Arc::clone(&store)).await;
        let id = scheduler
            .submit(request("flaky").with_max_retries(2).with_timeout(1))
            .await
            .unwrap();

        let work = from_fn(|ctx| async move {
            match ctx.attempt() {
                1 => Err(WorkError::retryable("connection reset")),
                2 => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(None)
                }
                _ => Ok(Some(json!("third time"))),
            }
        });
        let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
        assert_eq!(job.status, JobStatus::Completed, "{}", name);
        assert_eq!(job.retry_count, 2, "{}", name);
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Completed, "{}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_supersedes_the_attempt() {
    for (name, store) in common::stores() {
        let scheduler = scheduler_on(Arc::clone(&store)).await;
        let id = scheduler.submit(request("wait")).await.unwrap();

        let work = from_fn(|ctx| async move {
            ctx.cancelled().await;
            Err(WorkError::terminal("stopped"))
        });
        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.execute(id, Arc::new(work)).await })
        };
        while scheduler.get(id).await.unwrap().status != JobStatus::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scheduler.cancel(id, "user request").await.unwrap();
        let outcome = running.await.unwrap().unwrap();
        assert!(
            matches!(outcome, ExecutionOutcome::Superseded(ref job) if job.status == JobStatus::Cancelled),
            "{}: {:?}",
            name,
            outcome
        );
    }
}

#[tokio::test]
async fn test_written_version_scopes_progress() {
    for (name, store) in common::stores() {
        let mut job = conveyor_core::domain::job::Job::new(
            "owner-1",
            WorkSpec::new("export", serde_json::Value::Null),
            Default::default(),
            60,
            0,
        );
        let created = store.create(&job).await.unwrap();
        job.version = created.version;
        job.mark_running("w", chrono::Utc::now());

        let claimed = store.update(&job).await.unwrap();
        assert_eq!(claimed.version, store.get(job.id).await.unwrap().version, "{}", name);
        assert!(store.update_progress(job.id, claimed.version, 30.0, None).await.unwrap(), "{}", name);
        assert!(store.heartbeat(job.id, claimed.version).await.unwrap(), "{}", name);
        assert!(!store.update_progress(job.id, created.version, 60.0, None).await.unwrap(), "{}", name);
        assert_eq!(store.get(job.id).await.unwrap().progress_percent, 30.0, "{}", name);
    }
}

#[tokio::test(start_paused = true)]
async fn test_bulk_job_settles_the_parent() {
    for (name, store) in common::stores() {
        let scheduler = scheduler_on(Arc::clone(&store)).await;
        let mut registry = WorkRegistry::new();
        registry.register(
            "convert",
            Arc::new(from_fn(|ctx| async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(Some(ctx.payload().clone()))
            })),
        );
        let orchestrator = BulkOrchestrator::new(Arc::clone(&scheduler), Arc::new(registry));

        let bulk = scheduler.submit(request("bundle")).await.unwrap();
        let units = ["pdf", "docx"]
            .iter()
            .map(|f| SubUnitSpec::new(*f, WorkSpec::new("convert", json!(f))))
            .collect();
        let snapshot = orchestrator
            .start(bulk, units, 2, None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed, "{}", name);
        let parent = store.get(bulk).await.unwrap();
        assert_eq!(parent.status, JobStatus::Completed, "{}", name);
        assert_eq!(parent.progress_percent, 100.0, "{}", name);
    }
}
