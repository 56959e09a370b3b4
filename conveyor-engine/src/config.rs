//! Engine configuration
//!
//! Defines the tunables of the scheduler, worker pool and maintenance loop.
//! Every interval can be set from the environment in whole seconds.

use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identifies this process as the owner of the jobs it runs
    pub worker_id: String,

    /// Postgres connection string, only needed by the Postgres store
    pub database_url: Option<String>,

    /// How often the worker pool looks for pending jobs
    pub poll_interval: Duration,

    /// Maximum attempts awaited concurrently by this process
    pub max_parallel_jobs: usize,

    /// Pending jobs fetched per poll cycle
    pub claim_batch_size: usize,

    /// Backoff before each retry; the last entry repeats for later attempts
    pub retry_delays: Vec<Duration>,

    /// Running jobs older than this are considered orphaned
    pub orphan_timeout: Duration,

    /// How often the maintenance loop runs
    pub cleanup_interval: Duration,

    /// Finished jobs older than this are deleted by the maintenance loop
    pub cleanup_max_age: Duration,

    /// Applied when a submission carries no timeout
    pub default_job_timeout: Duration,

    /// Applied when a submission carries no retry budget
    pub default_max_retries: u32,

    /// Events kept per job for replay on subscribe
    pub event_history_limit: usize,

    pub db_max_connections: u32,
}

/// Rejected configuration values
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("retry_delays must be ascending")]
    UnorderedRetryDelays,

    #[error("default_job_timeout must be shorter than orphan_timeout")]
    TimeoutExceedsOrphanTimeout,
}

impl EngineConfig {
    /// Creates a new configuration with defaults
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            database_url: None,
            poll_interval: Duration::from_secs(2),
            max_parallel_jobs: 4,
            claim_batch_size: 10,
            retry_delays: vec![
                Duration::from_secs(0),
                Duration::from_secs(5),
                Duration::from_secs(15),
            ],
            orphan_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            cleanup_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            default_job_timeout: Duration::from_secs(300),
            default_max_retries: 2,
            event_history_limit: 50,
            db_max_connections: 10,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - WORKER_ID (optional, default: random uuid)
    /// - DATABASE_URL (optional)
    /// - POLL_INTERVAL (optional, seconds, default: 2)
    /// - MAX_PARALLEL_JOBS (optional, default: 4)
    /// - CLAIM_BATCH_SIZE (optional, default: 10)
    /// - RETRY_DELAYS (optional, comma-separated seconds, default: 0,5,15)
    /// - ORPHAN_TIMEOUT (optional, seconds, default: 1800)
    /// - CLEANUP_INTERVAL (optional, seconds, default: 3600)
    /// - CLEANUP_MAX_AGE (optional, seconds, default: 604800)
    /// - DEFAULT_JOB_TIMEOUT (optional, seconds, default: 300)
    /// - DEFAULT_MAX_RETRIES (optional, default: 2)
    /// - EVENT_HISTORY_LIMIT (optional, default: 50)
    /// - DB_MAX_CONNECTIONS (optional, default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(worker_id) = std::env::var("WORKER_ID") {
            config.worker_id = worker_id;
        }
        config.database_url = std::env::var("DATABASE_URL").ok();

        if let Some(secs) = env_parse::<u64>("POLL_INTERVAL")? {
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("MAX_PARALLEL_JOBS")? {
            config.max_parallel_jobs = n;
        }
        if let Some(n) = env_parse::<usize>("CLAIM_BATCH_SIZE")? {
            config.claim_batch_size = n;
        }
        if let Ok(raw) = std::env::var("RETRY_DELAYS") {
            config.retry_delays = parse_retry_delays(&raw)?;
        }
        if let Some(secs) = env_parse::<u64>("ORPHAN_TIMEOUT")? {
            config.orphan_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CLEANUP_INTERVAL")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("CLEANUP_MAX_AGE")? {
            config.cleanup_max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("DEFAULT_JOB_TIMEOUT")? {
            config.default_job_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("DEFAULT_MAX_RETRIES")? {
            config.default_max_retries = n;
        }
        if let Some(n) = env_parse::<usize>("EVENT_HISTORY_LIMIT")? {
            config.event_history_limit = n;
        }
        if let Some(n) = env_parse::<u32>("DB_MAX_CONNECTIONS")? {
            config.db_max_connections = n;
        }

        Ok(config)
    }

    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Backoff before the retry following failed attempt number `attempt`
    /// (0-based); attempts past the schedule reuse its last entry
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let idx = (attempt as usize).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays.get(idx).copied().unwrap_or_default()
    }

    /// How often long-lived owners (bulk drivers) refresh their heartbeat
    pub fn heartbeat_interval(&self) -> Duration {
        (self.orphan_timeout / 4).max(Duration::from_millis(100))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Empty("worker_id"));
        }

        let durations = [
            ("poll_interval", self.poll_interval),
            ("orphan_timeout", self.orphan_timeout),
            ("cleanup_interval", self.cleanup_interval),
            ("cleanup_max_age", self.cleanup_max_age),
            ("default_job_timeout", self.default_job_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }

        let limits = [
            ("max_parallel_jobs", self.max_parallel_jobs),
            ("claim_batch_size", self.claim_batch_size),
            ("event_history_limit", self.event_history_limit),
            ("db_max_connections", self.db_max_connections as usize),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if self.default_job_timeout >= self.orphan_timeout {
            return Err(ConfigError::TimeoutExceedsOrphanTimeout);
        }

        if self.retry_delays.is_empty() {
            return Err(ConfigError::Empty("retry_delays"));
        }
        if self.retry_delays.windows(2).any(|w| w[0] > w[1]) {
            return Err(ConfigError::UnorderedRetryDelays);
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}

/// Parses a comma-separated list of whole seconds, e.g. `0,5,15`
pub fn parse_retry_delays(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::Invalid {
                    name: "RETRY_DELAYS",
                    value: raw.to_string(),
                })
        })
        .collect()
}
