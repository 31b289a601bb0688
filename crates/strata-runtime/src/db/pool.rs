use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use strata_core::config::DatabaseConfig;
use strata_core::error::{Result, StrataError};

/// Connection pool to the database being migrated.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Validate the configuration and connect.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let options = config.connect_options()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect_with(options)
            .await
            .map_err(|e| StrataError::Storage(format!("Failed to connect to database: {}", e)))?;

        debug!(pool_size = config.pool_size, "Database pool created");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
