//! Work function contract
//!
//! A work function performs the actual task behind a job kind. It receives a
//! [`WorkContext`] with the job record, a progress reporter bound to the
//! current attempt, and a cancellation token it should poll for preemption.

use async_trait::async_trait;
use conveyor_core::domain::job::Job;
use conveyor_core::domain::progress::StepSpec;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::WorkError;
use crate::service::ProgressReporter;

/// Step used when a work function declares none
pub const DEFAULT_STEP: &str = "execute";

/// Performs the work of one job kind
#[async_trait]
pub trait WorkFunction: Send + Sync {
    /// Weighted steps reported by this work, for the given job
    fn steps(&self, _job: &Job) -> Vec<StepSpec> {
        vec![StepSpec::new(DEFAULT_STEP, 1.0)]
    }

    /// Runs one attempt and returns an opaque result reference
    async fn run(&self, ctx: WorkContext) -> Result<Option<JsonValue>, WorkError>;
}

/// Everything an attempt gets to see
#[derive(Clone)]
pub struct WorkContext {
    pub job: Job,
    pub progress: ProgressReporter,
    /// Fired on cancel, timeout and scheduler shutdown
    pub cancel: CancellationToken,
}

impl WorkContext {
    pub fn payload(&self) -> &JsonValue {
        &self.job.work.payload
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt should stop
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Number of the current attempt, starting at 1
    pub fn attempt(&self) -> u32 {
        self.job.retry_count + 1
    }
}

/// Work function built from an async closure
pub struct FnWork<F> {
    f: F,
    steps: Option<Vec<StepSpec>>,
}

/// Wraps an async closure as a [`WorkFunction`]
pub fn from_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonValue>, WorkError>> + Send + 'static,
{
    FnWork { f, steps: None }
}

impl<F> FnWork<F> {
    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = Some(steps);
        self
    }
}

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F>
where
    F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<JsonValue>, WorkError>> + Send + 'static,
{
    fn steps(&self, _job: &Job) -> Vec<StepSpec> {
        self.steps
            .clone()
            .unwrap_or_else(|| vec![StepSpec::new(DEFAULT_STEP, 1.0)])
    }

    async fn run(&self, ctx: WorkContext) -> Result<Option<JsonValue>, WorkError> {
        (self.f)(ctx).await
    }
}

/// Maps job kinds to the work functions that handle them
#[derive(Clone, Default)]
pub struct WorkRegistry {
    handlers: HashMap<String, Arc<dyn WorkFunction>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one for `kind`
    pub fn register(&mut self, kind: impl Into<String>, work: Arc<dyn WorkFunction>) -> &mut Self {
        self.handlers.insert(kind.into(), work);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn WorkFunction>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered kinds, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
