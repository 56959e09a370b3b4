//! Conveyor engine
//!
//! Executes jobs stored in a [`conveyor_store::JobStore`]: the scheduler owns
//! the job state machine, worker pools claim queued jobs, the bulk
//! orchestrator fans a job out into sub-units, and the notification hub
//! delivers status and progress events to observers.

pub mod config;
pub mod error;
pub mod scheduler;
pub mod service;
pub mod work;

pub use config::EngineConfig;
pub use error::{Result, SchedulerError, SinkError, WorkError};
pub use scheduler::{ExecutionOutcome, JobScheduler, MaintenanceLoop, MaintenanceReport, WorkerPool};
pub use service::{
    BulkHandle, BulkOrchestrator, ChannelSink, FinalizeHook, HubStats, NotificationHub,
    NotificationSink, ProgressReporter, SubUnitSpec,
};
pub use work::{WorkContext, WorkFunction, WorkRegistry, from_fn};
