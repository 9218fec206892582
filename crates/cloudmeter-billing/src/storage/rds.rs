use crate::config::DatabaseConfig;
use crate::error::{BillingError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error, info};

/// Connection pool to the ledger database
pub struct RdsConnection {
    pool: PgPool,
    config: DatabaseConfig,
}

impl RdsConnection {
    /// Connect straight to `config.url`.
    pub async fn new_direct(config: DatabaseConfig) -> Result<Self> {
        info!("Connecting to database: {}", config.display_url());

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(config.max_lifetime_seconds))
            .connect_lazy(&config.url)
            .map_err(|e| BillingError::database("create_pool", e))?;

        let connect = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_seconds),
            pool.acquire(),
        )
        .await;
        match connect {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(BillingError::database("connect", e)),
            Err(_) => {
                return Err(BillingError::DatabaseError {
                    operation: "connect".to_string(),
                    source: format!(
                        "no connection within {} seconds",
                        config.connect_timeout_seconds
                    )
                    .into(),
                })
            }
        }

        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        match sqlx::migrate!("./migrations").run(&self.pool).await {
            Ok(()) => {
                info!("Database migrations completed successfully");
                Ok(())
            }
            Err(e) => {
                error!("Failed to run database migrations: {}", e);
                Err(BillingError::DatabaseError {
                    operation: "run_migrations".to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}
