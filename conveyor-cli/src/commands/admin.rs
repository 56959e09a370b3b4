//! Admin command handlers
//!
//! Schema setup, queue statistics and housekeeping.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use conveyor_core::domain::job::{JobStatus, Priority};
use conveyor_core::dto::stats::{HealthMetrics, JobStatistics};
use conveyor_engine::MaintenanceLoop;
use conveyor_store::{JobStore, db};
use std::collections::BTreeMap;
use std::time::Duration;

use super::{scheduler, shutdown_on_ctrl_c};
use crate::config::Config;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Admin subcommands
#[derive(Subcommand)]
pub enum AdminCommands {
    /// Create the jobs table and its indexes
    Migrate,
    /// Job statistics over a recent window
    Stats {
        /// Window in seconds
        #[arg(long, default_value_t = 3600)]
        window: u64,
    },
    /// Queue health as seen from this worker id
    Health {
        /// Window in seconds for the failure rate
        #[arg(long, default_value_t = 3600)]
        window: u64,
    },
    /// Delete finished jobs older than the given age
    Cleanup {
        #[arg(long, default_value_t = 7)]
        max_age_days: u64,

        /// Statuses to keep regardless of age
        #[arg(long)]
        keep: Vec<JobStatus>,
    },
    /// Fail running jobs whose worker stopped reporting
    Recover {
        /// Seconds a job may run before it counts as orphaned
        #[arg(long, default_value_t = 1800)]
        timeout: u64,
    },
    /// Run recovery and cleanup periodically until Ctrl-C
    Maintain,
}

/// Handle admin commands
pub async fn handle_admin_command(command: AdminCommands, config: &Config) -> Result<()> {
    let store = config.connect().await?;

    match command {
        AdminCommands::Migrate => {
            db::run_migrations(store.pool())
                .await
                .context("Failed to run migrations")?;
            println!("{} Migrations applied", "✓".green());
            Ok(())
        }
        AdminCommands::Stats { window } => {
            let stats = store
                .statistics(Duration::from_secs(window))
                .await
                .context("Failed to compute statistics")?;
            print_statistics(&stats);
            Ok(())
        }
        AdminCommands::Health { window } => {
            let health = scheduler(store, config.engine()?)
                .health_metrics(Duration::from_secs(window))
                .await
                .context("Failed to compute health metrics")?;
            print_health(&health);
            Ok(())
        }
        AdminCommands::Cleanup { max_age_days, keep } => {
            let max_age = Duration::from_secs(max_age_days.saturating_mul(SECS_PER_DAY));
            let deleted = store
                .cleanup_older_than(max_age, &keep)
                .await
                .context("Failed to clean up jobs")?;
            println!("{} Deleted {} job(s)", "✓".green(), deleted);
            Ok(())
        }
        AdminCommands::Recover { timeout } => {
            let recovered = store
                .recover_orphaned(Duration::from_secs(timeout))
                .await
                .context("Failed to recover orphaned jobs")?;
            if recovered > 0 {
                println!("{} Failed {} orphaned job(s)", "⚠".yellow(), recovered);
            } else {
                println!("{} No orphaned jobs", "✓".green());
            }
            Ok(())
        }
        AdminCommands::Maintain => {
            let maintenance = MaintenanceLoop::new(store, config.engine()?);
            maintenance.run(shutdown_on_ctrl_c()).await;
            Ok(())
        }
    }
}

fn print_statistics(stats: &JobStatistics) {
    println!("{}", format!("Jobs created in the last {}s:", stats.window_secs).bold());
    for status in JobStatus::ALL {
        println!("  {:<10} {}", status.to_string(), stats.count(status));
    }
    println!("  {:<10} {}", "Total".bold(), stats.total);
    println!();
    println!("  Failure rate:     {}", format_rate(stats.failure_rate));
    println!(
        "  Avg processing:   {}",
        format_secs(stats.average_processing_secs)
    );
    println!(
        "  Oldest pending:   {}",
        format_secs(stats.oldest_pending_age_secs)
    );
    println!("  Running now:      {}", stats.running_count);
    print_queue_depth(&stats.pending_by_priority);
}

fn print_health(health: &HealthMetrics) {
    println!("{}", "Queue Health:".bold());
    println!("  Worker:           {}", health.worker_id.cyan());
    println!("  Pending:          {}", health.total_pending);
    println!("  Running:          {} ({} on this worker)", health.running_count, health.worker_running_count);
    println!("  Failure rate:     {}", format_rate(health.failure_rate));
    println!(
        "  Oldest pending:   {}",
        format_secs(health.oldest_pending_age_secs)
    );
    print_queue_depth(&health.queue_depth);
}

fn print_queue_depth(depth: &BTreeMap<Priority, u64>) {
    if depth.is_empty() {
        return;
    }
    println!("\n{}", "Pending by priority:".bold());
    for (priority, count) in depth.iter().rev() {
        println!("  {} {:<7} {}", "▸".cyan(), priority.to_string(), count);
    }
}

fn format_rate(rate: f64) -> ColoredString {
    let text = format!("{:.1}%", rate * 100.0);
    if rate > 0.25 {
        text.red()
    } else if rate > 0.05 {
        text.yellow()
    } else {
        text.green()
    }
}

fn format_secs(secs: Option<f64>) -> String {
    secs.map(|s| format!("{:.1}s", s)).unwrap_or_else(|| "-".to_string())
}
