//! End-to-end scheduling scenarios against the in-memory store

use conveyor_core::domain::event::EventPayload;
use conveyor_core::domain::job::{ErrorCode, JobStatus, Priority, WorkSpec};
use conveyor_core::domain::progress::StepSpec;
use conveyor_core::dto::job::SubmitJob;
use conveyor_engine::{
    ChannelSink, EngineConfig, ExecutionOutcome, JobScheduler, NotificationHub, SchedulerError,
    WorkError, WorkRegistry, WorkerPool, from_fn,
};
use conveyor_store::{JobStore, MemoryJobStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn scheduler_with(config: EngineConfig) -> Arc<JobScheduler> {
    Arc::new(JobScheduler::new(
        Arc::new(MemoryJobStore::new()),
        Arc::new(NotificationHub::default()),
        config,
    ))
}

async fn ready_scheduler() -> Arc<JobScheduler> {
    let scheduler = scheduler_with(EngineConfig::new("worker-1").with_retry_delays(vec![
        Duration::from_secs(0),
        Duration::from_secs(5),
        Duration::from_secs(15),
    ]));
    scheduler.recover_on_startup().await.unwrap();
    scheduler
}

fn request(kind: &str) -> SubmitJob {
    SubmitJob::new("owner-1", WorkSpec::new(kind, serde_json::Value::Null))
}

#[tokio::test(start_paused = true)]
async fn test_pool_runs_jobs_in_priority_order() {
    let mut config = EngineConfig::new("worker-1");
    config.max_parallel_jobs = 1;
    let scheduler = scheduler_with(config);

    let order = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&order);
    let mut registry = WorkRegistry::new();
    registry.register(
        "record",
        Arc::new(from_fn(move |ctx| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(ctx.job.priority);
                Ok(None)
            }
        })),
    );

    for priority in [Priority::Low, Priority::Urgent, Priority::Normal, Priority::High] {
        scheduler
            .submit(request("record").with_priority(priority))
            .await
            .unwrap();
    }

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(Arc::clone(&scheduler), Arc::new(registry));
    let running = tokio::spawn(pool.run(shutdown.clone()));

    for _ in 0..100 {
        let stats = scheduler.statistics(Duration::from_secs(3600)).await.unwrap();
        if stats.count(JobStatus::Completed) == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    shutdown.cancel();
    running.await.unwrap().unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec![Priority::Urgent, Priority::High, Priority::Normal, Priority::Low]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_until_budget_is_exhausted() {
    let scheduler = ready_scheduler().await;
    let id = scheduler
        .submit(request("flaky").with_max_retries(2))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new(64);
    scheduler.hub().register("watcher", Arc::new(sink));
    scheduler.hub().subscribe("watcher", id);

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let work = from_fn(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(WorkError::retryable("upstream returned 503")) }
    });

    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error.as_ref().map(|e| e.code), Some(ErrorCode::RetryableWork));

    let mut retrying = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventPayload::Retrying { next_attempt, delay_secs, .. } = event.payload {
            retrying.push((next_attempt, delay_secs));
        }
    }
    assert_eq!(retrying, vec![(2, 0.0), (3, 5.0)]);

    assert!(matches!(
        scheduler.retry(id).await,
        Err(SchedulerError::RetriesExhausted { retry_count: 2, max_retries: 2, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_on_second_attempt() {
    let scheduler = ready_scheduler().await;
    let id = scheduler
        .submit(
            request("flaky")
                .with_priority(Priority::High)
                .with_max_retries(1),
        )
        .await
        .unwrap();

    let work = from_fn(|ctx| async move {
        if ctx.attempt() == 1 {
            Err(WorkError::retryable("connection reset"))
        } else {
            Ok(Some(serde_json::json!({ "path": "out/report.pdf" })))
        }
    });

    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.progress_percent, 100.0);
    assert!(job.error.is_none());
    assert_eq!(job.result_ref, Some(serde_json::json!({ "path": "out/report.pdf" })));
}

#[tokio::test(start_paused = true)]
async fn test_attempt_times_out() {
    let scheduler = ready_scheduler().await;
    let id = scheduler
        .submit(request("slow").with_timeout(1).with_max_retries(0))
        .await
        .unwrap();

    let work = from_fn(|_ctx| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    });

    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert_eq!(job.error.map(|e| e.code), Some(ErrorCode::Timeout));
    assert!(job.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retried_when_allowed() {
    let scheduler = ready_scheduler().await;
    let id = scheduler
        .submit(request("slow").with_timeout(1).with_max_retries(1))
        .await
        .unwrap();

    let work = from_fn(|ctx| async move {
        if ctx.attempt() == 1 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(None)
    });
    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);

    let id = scheduler
        .submit(
            request("slow")
                .with_timeout(1)
                .with_max_retries(1)
                .without_timeout_retries(),
        )
        .await
        .unwrap();
    let work = from_fn(|_ctx| async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(None)
    });
    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::TimedOut);
    assert_eq!(job.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_running_job() {
    let scheduler = ready_scheduler().await;
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
    assert_eq!(scheduler.in_flight_count(), 1);

    let cancelled = scheduler.cancel(id, "user request").await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Superseded(ref job) if job.status == JobStatus::Cancelled));
    let stored = scheduler.get(id).await.unwrap();
    assert_eq!(stored.error.map(|e| e.message), Some("user request".to_string()));
    assert_eq!(scheduler.in_flight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_persisted_and_published() {
    let scheduler = ready_scheduler().await;
    let id = scheduler.submit(request("export")).await.unwrap();

    let (sink, mut events) = ChannelSink::new(64);
    scheduler.hub().register("watcher", Arc::new(sink));
    let replayed = scheduler.hub().subscribe("watcher", id);
    assert_eq!(replayed, 1);

    let work = from_fn(|ctx| async move {
        let progress = &ctx.progress;
        progress.start_step("fetch").await.ok();
        progress.update_step("fetch", 50.0, Some("half")).await.ok();
        progress.start_step("write").await.ok();
        progress.complete_step("write", None).await.ok();
        Ok(None)
    })
    .with_steps(vec![StepSpec::new("fetch", 0.4), StepSpec::new("write", 0.6)]);

    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::Completed);

    let mut percents = Vec::new();
    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event.payload {
            EventPayload::Progress { percent, .. } => percents.push(percent),
            EventPayload::Status { status, .. } => statuses.push(status),
            _ => {}
        }
    }
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(percents.last().copied(), Some(100.0));
    assert_eq!(
        statuses,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Completed]
    );
}

#[tokio::test]
async fn test_startup_recovery_fails_orphans_once() {
    let store = Arc::new(MemoryJobStore::new());
    let mut orphan = conveyor_core::domain::job::Job::new(
        "owner-1",
        WorkSpec::new("export", serde_json::Value::Null),
        Priority::Normal,
        60,
        0,
    );
    orphan.mark_running("crashed-worker", chrono::Utc::now() - chrono::Duration::hours(1));
    store.create(&orphan).await.unwrap();

    let scheduler = JobScheduler::new(
        store.clone(),
        Arc::new(NotificationHub::default()),
        EngineConfig::new("worker-1"),
    );
    assert!(!scheduler.is_ready());
    assert_eq!(scheduler.recover_on_startup().await.unwrap(), 1);
    assert_eq!(scheduler.recover_on_startup().await.unwrap(), 1);
    assert!(scheduler.is_ready());

    let recovered = store.get(orphan.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Failed);
    assert_eq!(recovered.error.map(|e| e.code), Some(ErrorCode::Orphaned));
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_attempt_cannot_report_on_its_retry() {
    let scheduler = ready_scheduler().await;
    let id = scheduler
        .submit(request("render").with_timeout(2).with_max_retries(1))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new(64);
    scheduler.hub().register("watcher", Arc::new(sink));
    scheduler.hub().subscribe("watcher", id);

    let seen_by_retry = Arc::new(Mutex::new(None));
    let seen = Arc::clone(&seen_by_retry);
    let store = Arc::clone(scheduler.store());
    let work = from_fn(move |ctx| {
        let (seen, store) = (Arc::clone(&seen), Arc::clone(&store));
        async move {
            if ctx.attempt() == 1 {
                // Ignores its timeout and reports once the retry is running
                tokio::time::sleep(Duration::from_secs(3)).await;
                ctx.progress.update_step("execute", 90.0, None).await.ok();
                return Ok(None);
            }
            ctx.progress.update_step("execute", 10.0, None).await.ok();
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let stored = store.get(ctx.job.id).await.unwrap();
            *seen.lock().unwrap() = Some(stored.progress_percent);
            Ok(None)
        }
    });

    let job = scheduler.execute(id, Arc::new(work)).await.unwrap().into_job();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(*seen_by_retry.lock().unwrap(), Some(10.0));

    let mut percents = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventPayload::Progress { percent, .. } = event.payload {
            percents.push(percent);
        }
    }
    assert_eq!(percents, vec![10.0]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_backoff() {
    let scheduler = scheduler_with(
        EngineConfig::new("worker-1").with_retry_delays(vec![Duration::from_secs(30)]),
    );
    scheduler.recover_on_startup().await.unwrap();
    let id = scheduler
        .submit(request("flaky").with_max_retries(3))
        .await
        .unwrap();

    let (sink, mut events) = ChannelSink::new(64);
    scheduler.hub().register("watcher", Arc::new(sink));
    scheduler.hub().subscribe("watcher", id);

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    let work = from_fn(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err(WorkError::retryable("upstream returned 503")) }
    });
    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(id, Arc::new(work)).await })
    };

    // Waiting out the backoff: still owned and Running, with the error kept
    loop {
        let job = scheduler.get(id).await.unwrap();
        if job.error.is_some() {
            assert_eq!(job.status, JobStatus::Running);
            assert_eq!(job.retry_count, 0);
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let cancelled = scheduler.cancel(id, "no longer needed").await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Superseded(ref job) if job.status == JobStatus::Cancelled));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EventPayload::Status { status, .. } = event.payload {
            statuses.push(status);
        }
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Pending, JobStatus::Running, JobStatus::Cancelled]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_fails_the_job() {
    let scheduler = scheduler_with(
        EngineConfig::new("worker-1").with_retry_delays(vec![Duration::from_secs(30)]),
    );
    scheduler.recover_on_startup().await.unwrap();
    let id = scheduler
        .submit(request("flaky").with_max_retries(3))
        .await
        .unwrap();

    let work = from_fn(|_ctx| async { Err(WorkError::retryable("upstream returned 503")) });
    let running = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.execute(id, Arc::new(work)).await })
    };
    while scheduler.get(id).await.unwrap().error.is_none() {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    scheduler.shutdown();
    let job = running.await.unwrap().unwrap().into_job();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.error.clone().map(|e| e.code), Some(ErrorCode::RetryableWork));
    assert!(job.can_retry());
}
