//! Weighted step progress model
//!
//! Tracks fractional completion of one execution attempt. The caller supplies
//! the ordered step list (names, weights and optional duration estimates) for
//! the kind of work being tracked; the model knows nothing about the work.
//!
//! Progress never moves backwards through the normal step operations: updates
//! keep the highest percentage seen for a step, and finished steps ignore
//! further changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tolerance when checking that step weights sum to 1.0
pub const WEIGHT_EPSILON: f64 = 1e-6;

/// Estimate used for steps that do not declare one
pub const DEFAULT_STEP_ESTIMATE: Duration = Duration::from_secs(30);

/// Errors raised by the progress model
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProgressError {
    #[error("invalid step specification: {0}")]
    InvalidSpec(String),

    #[error("step not found: {0}")]
    StepNotFound(String),
}

pub type Result<T> = std::result::Result<T, ProgressError>;

/// Declaration of one weighted step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    /// Fraction of the whole operation, all weights sum to 1.0
    pub weight: f64,
    pub estimated_duration: Option<Duration>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
            estimated_duration: None,
        }
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = Some(estimate);
        self
    }
}

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    fn is_finished(&self) -> bool {
        match self {
            StepStatus::Pending | StepStatus::Running => false,
            StepStatus::Completed
            | StepStatus::Failed
            | StepStatus::Skipped
            | StepStatus::Cancelled => true,
        }
    }
}

/// Current state of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub weight: f64,
    pub estimated_duration: Option<Duration>,
    pub status: StepStatus,
    /// Completion within this step, 0-100
    pub percent: f64,
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    fn from_spec(spec: StepSpec) -> Self {
        Self {
            name: spec.name,
            weight: spec.weight,
            estimated_duration: spec.estimated_duration,
            status: StepStatus::Pending,
            percent: 0.0,
            message: None,
            details: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Contribution to the overall percentage, before weighting
    fn effective_percent(&self) -> f64 {
        match self.status {
            StepStatus::Completed | StepStatus::Skipped => 100.0,
            StepStatus::Running => self.percent,
            StepStatus::Pending | StepStatus::Failed | StepStatus::Cancelled => 0.0,
        }
    }

    fn finish(&mut self, status: StepStatus, now: DateTime<Utc>) {
        self.status = status;
        self.started_at.get_or_insert(now);
        self.completed_at = Some(now);
    }
}

/// Point-in-time view of a progress model, suitable for events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub overall_percent: f64,
    pub current_step: Option<String>,
    pub message: Option<String>,
    pub estimated_remaining_secs: Option<f64>,
    pub steps: Vec<Step>,
}

/// Ordered, weighted step tracker for one execution attempt
#[derive(Debug, Clone)]
pub struct ProgressModel {
    steps: Vec<Step>,
}

impl ProgressModel {
    /// Builds a model from step declarations
    ///
    /// Rejects an empty list, duplicate names, negative or non-finite weights,
    /// and weights that do not sum to 1.0 within [`WEIGHT_EPSILON`].
    pub fn new(specs: Vec<StepSpec>) -> Result<Self> {
        validate_specs(&specs)?;
        Ok(Self {
            steps: specs.into_iter().map(Step::from_spec).collect(),
        })
    }

    /// A single step carrying the full weight
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            steps: vec![Step::from_spec(StepSpec::new(name, 1.0))],
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// The single step currently running
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }

    pub fn start_step(&mut self, name: &str) -> Result<()> {
        self.start_step_at(name, Utc::now())
    }

    /// Starts a pending step; any other running step is completed first so
    /// only one step runs at a time
    pub fn start_step_at(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        let idx = self.index_of(name)?;
        if self.steps[idx].status != StepStatus::Pending {
            return Ok(());
        }

        for (i, step) in self.steps.iter_mut().enumerate() {
            if i != idx && step.status == StepStatus::Running {
                step.percent = 100.0;
                step.finish(StepStatus::Completed, now);
            }
        }

        let step = &mut self.steps[idx];
        step.status = StepStatus::Running;
        step.started_at = Some(now);
        Ok(())
    }

    /// Records progress within a step, clamped to [0, 100]
    ///
    /// A pending step is started first. Finished steps are left untouched.
    pub fn update_step(&mut self, name: &str, percent: f64, note: Option<String>) -> Result<()> {
        let idx = self.index_of(name)?;
        let now = Utc::now();
        match self.steps[idx].status {
            StepStatus::Pending => self.start_step_at(name, now)?,
            StepStatus::Running => {}
            StepStatus::Completed
            | StepStatus::Failed
            | StepStatus::Skipped
            | StepStatus::Cancelled => return Ok(()),
        }

        let step = &mut self.steps[idx];
        let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
        step.percent = step.percent.max(percent);
        if note.is_some() {
            step.message = note;
        }
        Ok(())
    }

    /// Completes a step and starts the next pending one
    pub fn complete_step(&mut self, name: &str, details: Option<serde_json::Value>) -> Result<()> {
        let idx = self.index_of(name)?;
        if self.steps[idx].status.is_finished() {
            return Ok(());
        }
        let now = Utc::now();
        let step = &mut self.steps[idx];
        step.percent = 100.0;
        step.details = details;
        step.finish(StepStatus::Completed, now);
        self.advance_from(idx, now);
        Ok(())
    }

    pub fn fail_step(&mut self, name: &str, reason: &str) -> Result<()> {
        self.finish_step(name, StepStatus::Failed, reason)
    }

    /// Skips a step; it counts as done and the next pending step starts
    pub fn skip_step(&mut self, name: &str, reason: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        let was_finished = self.steps[idx].status.is_finished();
        self.finish_step(name, StepStatus::Skipped, reason)?;
        if !was_finished {
            self.advance_from(idx, Utc::now());
        }
        Ok(())
    }

    pub fn cancel_step(&mut self, name: &str, reason: &str) -> Result<()> {
        self.finish_step(name, StepStatus::Cancelled, reason)
    }

    /// Overall completion on a 0-100 scale
    pub fn overall_percent(&self) -> f64 {
        if self.is_done() {
            return 100.0;
        }
        let total: f64 = self
            .steps
            .iter()
            .map(|s| s.weight * s.effective_percent())
            .sum();
        total.clamp(0.0, 100.0)
    }

    /// Whether every step is completed or skipped
    pub fn is_done(&self) -> bool {
        self.steps
            .iter()
            .all(|s| matches!(s.status, StepStatus::Completed | StepStatus::Skipped))
    }

    /// Time remaining, from declared estimates and the running step's progress
    ///
    /// Returns `None` when no step has started and no step declares an estimate.
    pub fn estimate_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let any_started = self.steps.iter().any(|s| s.started_at.is_some());
        let any_estimate = self.steps.iter().any(|s| s.estimated_duration.is_some());
        if !any_started && !any_estimate {
            return None;
        }

        let mut remaining = 0.0_f64;
        for step in &self.steps {
            let estimate = step
                .estimated_duration
                .unwrap_or(DEFAULT_STEP_ESTIMATE)
                .as_secs_f64();
            match step.status {
                StepStatus::Running => {
                    let elapsed = step
                        .started_at
                        .and_then(|started| now.signed_duration_since(started).to_std().ok())
                        .map(|d| d.as_secs_f64())
                        .unwrap_or(0.0);
                    let left = (estimate - elapsed).max(0.0);
                    remaining += left * (1.0 - step.percent / 100.0);
                }
                StepStatus::Pending => remaining += estimate,
                StepStatus::Completed
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Cancelled => {}
            }
        }
        Some(Duration::from_secs_f64(remaining.max(0.0)))
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let current = self.current_step();
        ProgressSnapshot {
            overall_percent: self.overall_percent(),
            current_step: current.map(|s| s.name.clone()),
            message: current.and_then(|s| s.message.clone()),
            estimated_remaining_secs: self
                .estimate_remaining(Utc::now())
                .map(|d| d.as_secs_f64()),
            steps: self.steps.clone(),
        }
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.steps
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| ProgressError::StepNotFound(name.to_string()))
    }

    fn finish_step(&mut self, name: &str, status: StepStatus, reason: &str) -> Result<()> {
        let idx = self.index_of(name)?;
        let step = &mut self.steps[idx];
        if step.status.is_finished() {
            return Ok(());
        }
        step.message = Some(reason.to_string());
        step.finish(status, Utc::now());
        Ok(())
    }

    /// Starts the first pending step after `idx` unless something is running
    fn advance_from(&mut self, idx: usize, now: DateTime<Utc>) {
        if self.current_step().is_some() {
            return;
        }
        if let Some(next) = self.steps[idx + 1..]
            .iter_mut()
            .find(|s| s.status == StepStatus::Pending)
        {
            next.status = StepStatus::Running;
            next.started_at = Some(now);
        }
    }
}

fn validate_specs(specs: &[StepSpec]) -> Result<()> {
    if specs.is_empty() {
        return Err(ProgressError::InvalidSpec(
            "at least one step is required".to_string(),
        ));
    }

    for (i, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return Err(ProgressError::InvalidSpec(format!(
                "step {} has an empty name",
                i
            )));
        }
        if !spec.weight.is_finite() || spec.weight < 0.0 {
            return Err(ProgressError::InvalidSpec(format!(
                "step '{}' has invalid weight {}",
                spec.name, spec.weight
            )));
        }
        if specs[..i].iter().any(|other| other.name == spec.name) {
            return Err(ProgressError::InvalidSpec(format!(
                "duplicate step name '{}'",
                spec.name
            )));
        }
    }

    let sum: f64 = specs.iter().map(|s| s.weight).sum();
    if (sum - 1.0).abs() > WEIGHT_EPSILON {
        return Err(ProgressError::InvalidSpec(format!(
            "step weights sum to {}, expected 1.0",
            sum
        )));
    }

    Ok(())
}
