//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod admin;
mod job;
mod worker;

pub use admin::AdminCommands;
pub use job::JobCommands;

use anyhow::Result;
use clap::Subcommand;
use conveyor_engine::{EngineConfig, JobScheduler, NotificationHub};
use conveyor_store::JobStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Schema, statistics and housekeeping
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Run a worker pool with the built-in work kinds until Ctrl-C
    Worker,
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
        Commands::Admin { command } => admin::handle_admin_command(command, config).await,
        Commands::Worker => worker::run_worker(config).await,
    }
}

/// Scheduler over `store` with a private notification hub
fn scheduler(store: Arc<dyn JobStore>, engine: EngineConfig) -> Arc<JobScheduler> {
    let hub = Arc::new(NotificationHub::new(engine.event_history_limit));
    Arc::new(JobScheduler::new(store, hub, engine))
}

/// Token cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, shutting down");
        }
        trigger.cancel();
    });
    token
}
