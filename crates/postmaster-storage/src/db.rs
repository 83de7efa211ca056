//! Database connection and pool management

use postmaster_common::config::DatabaseConfig;
use postmaster_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info};

/// Database pool wrapper
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// Connect using the `[database]` section of the configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let url = Self::database_url(config)?;

        info!(backend = %config.backend, "Connecting to rule store");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect: {}", e)))?;

        info!("Rule store connection established");

        Ok(Self { pool })
    }

    fn database_url(config: &DatabaseConfig) -> Result<String> {
        match config.backend.as_str() {
            "postgres" | "postgresql" => config
                .url
                .clone()
                .ok_or_else(|| Error::Config("database.url is required".to_string())),
            other => Err(Error::Config(format!(
                "Unsupported database backend: {}",
                other
            ))),
        }
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `postmaster_filter` and `mail_account` tables if missing
    pub async fn migrate(&self) -> Result<()> {
        debug!("Running postmaster migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;

        info!("Postmaster migrations completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: &str, url: Option<&str>) -> DatabaseConfig {
        DatabaseConfig {
            backend: backend.to_string(),
            url: url.map(str::to_string),
            max_connections: 1,
            min_connections: 0,
            run_migrations: false,
        }
    }

    #[test]
    fn test_database_url() {
        let url = DatabasePool::database_url(&config("postgres", Some("postgres://db/goatflow")));
        assert_eq!(url.unwrap(), "postgres://db/goatflow");

        assert!(matches!(
            DatabasePool::database_url(&config("postgres", None)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DatabasePool::database_url(&config("mysql", Some("mysql://db"))),
            Err(Error::Config(_))
        ));
    }
}
