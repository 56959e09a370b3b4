//! Built-in work kinds
//!
//! Small work functions for smoke-testing a deployment end to end:
//!
//! - `echo` completes immediately with its payload as the result
//! - `sleep` waits `{"seconds": n}`, reporting progress every second, and
//!   fails with a retryable error when `{"fail": true}` is set

use async_trait::async_trait;
use conveyor_core::domain::job::Job;
use conveyor_core::domain::progress::StepSpec;
use conveyor_engine::{WorkContext, WorkError, WorkFunction, WorkRegistry, from_fn};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

const SLEEP_STEP: &str = "sleep";

pub fn registry() -> WorkRegistry {
    let mut registry = WorkRegistry::new();
    registry
        .register(
            "echo",
            Arc::new(from_fn(|ctx: WorkContext| async move {
                Ok(Some(ctx.payload().clone()))
            })),
        )
        .register("sleep", Arc::new(SleepWork));
    registry
}

struct SleepWork;

#[async_trait]
impl WorkFunction for SleepWork {
    fn steps(&self, _job: &Job) -> Vec<StepSpec> {
        vec![StepSpec::new(SLEEP_STEP, 1.0)]
    }

    async fn run(&self, ctx: WorkContext) -> Result<Option<JsonValue>, WorkError> {
        let seconds = ctx.payload()["seconds"].as_u64().unwrap_or(1);
        let progress = &ctx.progress;
        progress.start_step(SLEEP_STEP).await.ok();

        for elapsed in 1..=seconds {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancelled() => {
                    progress.cancel_step(SLEEP_STEP, "interrupted").await.ok();
                    return Err(WorkError::terminal("sleep interrupted"));
                }
            }
            let percent = elapsed as f64 * 100.0 / seconds as f64;
            let note = format!("{}/{}s", elapsed, seconds);
            progress.update_step(SLEEP_STEP, percent, Some(&note)).await.ok();
        }

        if ctx.payload()["fail"] == JsonValue::Bool(true) {
            progress.fail_step(SLEEP_STEP, "asked to fail").await.ok();
            return Err(WorkError::retryable("sleep asked to fail"));
        }
        progress.complete_step(SLEEP_STEP, None).await.ok();
        Ok(Some(serde_json::json!({ "slept_secs": seconds })))
    }
}
