use crate::config::Config;
use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    create_pool_with_timeout(database_url, max_connections, 10).await
}

pub async fn create_pool_with_timeout(
    database_url: &str,
    max_connections: u32,
    acquire_timeout_seconds: u64,
) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(acquire_timeout_seconds))
        .idle_timeout(Some(Duration::from_secs(300)))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").fetch_one(&pool).await?;

    info!("Connected to PostgreSQL with {} max connections", max_connections);
    Ok(pool)
}

pub async fn pool_from_config(config: &Config) -> Result<PgPool> {
    info!("Connecting to {}", config.safe_database_url());
    create_pool_with_timeout(
        &config.database_url,
        config.operational.max_db_connections,
        config.operational.connection_timeout_seconds,
    )
    .await
}
