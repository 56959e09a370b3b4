//! Job command handlers
//!
//! Submitting, listing, inspecting, cancelling and retrying jobs.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use conveyor_core::domain::job::{Job, JobStatus, Priority, WorkSpec};
use conveyor_core::dto::job::{OwnerJobsQuery, SubmitJob};
use conveyor_store::JobStore;
use std::sync::Arc;
use uuid::Uuid;

use super::scheduler;
use crate::config::Config;

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Submit a new job
    Submit {
        /// Owner of the job
        #[arg(long)]
        owner: String,

        /// Work kind, as registered by the workers
        kind: String,

        /// JSON payload handed to the work function
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Low, Normal, High or Urgent
        #[arg(long, default_value = "Normal")]
        priority: Priority,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retry budget
        #[arg(long)]
        max_retries: Option<u32>,

        /// Do not retry attempts that time out
        #[arg(long)]
        no_timeout_retry: bool,
    },
    /// List an owner's jobs, newest first
    List {
        /// Owner of the jobs
        owner: String,

        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,

        /// Hide jobs that reached an end state
        #[arg(long)]
        active: bool,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List queued jobs in dequeue order
    Pending {
        /// Only jobs with this priority
        #[arg(long)]
        priority: Option<Priority>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Get job details
    Get {
        id: Uuid,

        /// Also show the job's sub-units
        #[arg(long)]
        children: bool,
    },
    /// Cancel a pending or running job
    Cancel {
        id: Uuid,

        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Queue a failed or timed out job again
    Retry { id: Uuid },
}

/// Handle job commands
pub async fn handle_job_command(command: JobCommands, config: &Config) -> Result<()> {
    let store = config.connect().await?;

    match command {
        JobCommands::Submit {
            owner,
            kind,
            payload,
            priority,
            timeout,
            max_retries,
            no_timeout_retry,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("Payload is not valid JSON")?;
            let mut request = SubmitJob::new(owner, WorkSpec::new(kind, payload)).with_priority(priority);
            request.timeout_seconds = timeout;
            request.max_retries = max_retries;
            if no_timeout_retry {
                request = request.without_timeout_retries();
            }
            submit_job(store, config, request).await
        }
        JobCommands::List {
            owner,
            status,
            active,
            limit,
        } => {
            let query = OwnerJobsQuery {
                status,
                include_finished: !active,
                limit,
            };
            list_owner_jobs(store.as_ref(), &owner, &query).await
        }
        JobCommands::Pending { priority, limit } => list_pending_jobs(store.as_ref(), priority, limit).await,
        JobCommands::Get { id, children } => get_job(store.as_ref(), id, children).await,
        JobCommands::Cancel { id, reason } => {
            let job = scheduler(store, config.engine()?)
                .cancel(id, &reason)
                .await
                .with_context(|| format!("Failed to cancel job {}", id))?;
            println!("{} Job {} cancelled", "✓".green(), job.id.to_string().cyan());
            Ok(())
        }
        JobCommands::Retry { id } => {
            let job = scheduler(store, config.engine()?)
                .retry(id)
                .await
                .with_context(|| format!("Failed to retry job {}", id))?;
            println!(
                "{} Job {} queued again (retry {}/{})",
                "✓".green(),
                job.id.to_string().cyan(),
                job.retry_count,
                job.max_retries
            );
            Ok(())
        }
    }
}

async fn submit_job(store: Arc<dyn JobStore>, config: &Config, request: SubmitJob) -> Result<()> {
    let id = scheduler(store, config.engine()?)
        .submit(request)
        .await
        .context("Failed to submit job")?;

    println!("{} Job submitted", "✓".green());
    println!("  ID: {}", id.to_string().cyan());
    Ok(())
}

async fn list_owner_jobs(store: &dyn JobStore, owner: &str, query: &OwnerJobsQuery) -> Result<()> {
    let jobs = store
        .list_by_owner(owner, query)
        .await
        .context("Failed to list jobs")?;

    if jobs.is_empty() {
        println!("{}", format!("No jobs found for {}.", owner).yellow());
    } else {
        println!("{}", format!("Found {} job(s) for {}:", jobs.len(), owner).bold());
        println!();
        for job in &jobs {
            print_job_summary(job);
        }
    }
    Ok(())
}

async fn list_pending_jobs(store: &dyn JobStore, priority: Option<Priority>, limit: usize) -> Result<()> {
    let jobs = store
        .list_pending(priority, limit)
        .await
        .context("Failed to list pending jobs")?;

    if jobs.is_empty() {
        println!("{}", "No pending jobs.".yellow());
    } else {
        println!("{}", format!("Found {} pending job(s):", jobs.len()).bold());
        println!();
        for job in &jobs {
            print_job_summary(job);
        }
    }
    Ok(())
}

async fn get_job(store: &dyn JobStore, id: Uuid, with_children: bool) -> Result<()> {
    let job = store
        .get(id)
        .await
        .with_context(|| format!("Failed to load job {}", id))?;
    print_job_details(&job);

    if with_children {
        let children = store
            .list_children(id)
            .await
            .context("Failed to list sub-units")?;
        println!("\n{}", format!("Sub-units ({}):", children.len()).bold());
        for child in &children {
            println!(
                "  {} {} {:>6.1}%  {}",
                "▸".cyan(),
                child.id.to_string().dimmed(),
                child.progress_percent,
                colorize_status(&child.status)
            );
        }
    }
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

/// Print a job summary
fn print_job_summary(job: &Job) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Kind:     {}", job.work.kind);
    println!("    Status:   {}", colorize_status(&job.status));
    println!("    Priority: {}", job.priority);
    println!("    Progress: {:.1}%", job.progress_percent);
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    if let Some(worker) = &job.worker_id {
        println!("    Worker:   {}", worker.dimmed());
    }
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Owner:       {}", job.owner_id);
    println!("  Kind:        {}", job.work.kind);
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Priority:    {}", job.priority);
    println!(
        "  Progress:    {:.1}%{}",
        job.progress_percent,
        job.progress_message
            .as_deref()
            .map(|m| format!(" ({})", m))
            .unwrap_or_default()
    );
    println!("  Attempts:    {} (retries {}/{})", job.retry_count + 1, job.retry_count, job.max_retries);
    println!("  Timeout:     {}s", job.timeout_seconds);
    if let Some(parent) = job.parent_id {
        println!("  Bulk job:    {}", parent.to_string().dimmed());
    }
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(seen) = job.heartbeat_at.filter(|_| job.status == JobStatus::Running) {
        println!("  Heartbeat:   {}", seen.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(completed) = job.completed_at {
        println!("  Completed:   {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(duration) = job.processing_time() {
        println!("  Duration:    {}s", duration.num_seconds());
    }

    if let Some(worker) = &job.worker_id {
        println!("  Worker:      {}", worker);
    }

    if !job.work.payload.is_null() {
        println!("\n{}", "Payload:".bold());
        print_json(&job.work.payload);
    }

    if let Some(result) = &job.result_ref {
        println!("\n{}", "Result:".bold());
        print_json(result);
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("  {} {}", error.code.to_string().red(), error.message.red());
        if let Some(details) = &error.details {
            print_json(details);
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(pretty) => println!("{}", pretty),
        Err(_) => println!("{:?}", value),
    }
}

/// Colorize job status for display
fn colorize_status(status: &JobStatus) -> colored::ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
        JobStatus::Cancelled => status_str.dimmed(),
        JobStatus::TimedOut => status_str.red(),
    }
}
