//! Postgres connection pool and embedded migrations.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::DbError;

/// Shared pool handed to [`PgStateStore`](crate::PgStateStore).
pub type DbPool = PgPool;

/// How long a store call waits for a free connection before the attempt
/// counts as a transient failure.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `database_url` with at most `max_connections` connections.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    let max_connections = max_connections.max(1);
    info!(max_connections, "connecting to execution store");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply the `executions` / `step_executions` migrations embedded from the
/// workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("applying execution store migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
