//! Scheduling and background loops

mod maintenance;
mod manager;
mod poller;

pub use maintenance::{MaintenanceLoop, MaintenanceReport};
pub use manager::{ExecutionOutcome, JobScheduler};
pub use poller::WorkerPool;
