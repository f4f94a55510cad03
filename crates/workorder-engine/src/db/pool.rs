//! Database connection pool management.

use crate::config::DatabaseConfig;
use sqlx::PgPool;

/// Type alias for the PostgreSQL connection pool.
pub type DbPool = PgPool;

/// Create the connection pool used by [`PgStore`](super::PgStore).
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    let pool = config
        .pool_options()
        .connect_with(config.connect_options()?)
        .await?;

    tracing::info!(
        target_db = %config.target(),
        max_connections = config.max_connections,
        statement_timeout_ms = config.statement_timeout_ms,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Whether the database answers a trivial query.
pub async fn health_check(pool: &DbPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}
