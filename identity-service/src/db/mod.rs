//! PostgreSQL pool, migrations and schema checks for the identity store.

use crate::config::DatabaseConfig;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Pool settings derived from configuration.
pub fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .idle_timeout((config.idle_timeout_seconds > 0).then(|| Duration::from_secs(config.idle_timeout_seconds)))
        .max_lifetime((config.max_lifetime_seconds > 0).then(|| Duration::from_secs(config.max_lifetime_seconds)))
}

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Connecting to identity database"
    );

    let pool = pool_options(config).connect(&config.url).await?;

    tracing::info!("Connected to identity database");
    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running identity schema migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Identity schema is up to date");
    Ok(())
}

pub async fn health_check(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Whether `role_name` is seeded. Registration assigns the configured
/// default role, so a missing row means migrations were not applied.
pub async fn role_exists(pool: &PgPool, role_name: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM roles WHERE role_name = $1)")
        .bind(role_name)
        .fetch_one(pool)
        .await
}
