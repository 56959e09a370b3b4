//! Conveyor CLI
//!
//! Administration tool for a Conveyor job store. Talks to Postgres directly:
//! submits and inspects jobs, runs maintenance, and can host a worker pool
//! with the built-in work kinds.

mod builtin;
mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Conveyor job scheduler CLI", long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Maximum connections in the database pool
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=info,conveyor_engine=info,conveyor_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config {
        database_url: cli.database_url,
        max_connections: cli.max_connections,
    };

    handle_command(cli.command, &config).await
}
