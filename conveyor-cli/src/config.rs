//! CLI configuration

use anyhow::{Context, Result};
use conveyor_engine::EngineConfig;
use conveyor_store::{PgJobStore, db};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
}

impl Config {
    /// Connects to the database and wraps the pool in a job store
    pub async fn connect(&self) -> Result<Arc<PgJobStore>> {
        let pool = db::create_pool(&self.database_url, self.max_connections)
            .await
            .context("Failed to connect to database")?;
        Ok(Arc::new(PgJobStore::new(pool)))
    }

    /// Engine settings from the environment, pointed at this database
    pub fn engine(&self) -> Result<EngineConfig> {
        let mut engine = EngineConfig::from_env().context("Invalid engine configuration")?;
        engine.database_url = Some(self.database_url.clone());
        engine.validate().context("Invalid engine configuration")?;
        Ok(engine)
    }
}
