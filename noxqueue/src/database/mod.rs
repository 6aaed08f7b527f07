//! Persistence layer for the job queue.
//!
//! SQLite through sqlx: connection pool management, migrations, row models
//! and the repositories the lifecycle authority and workers talk to.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Pragmas that SQLite scopes to a single connection.
///
/// `cache_size` is negative, so it is in KiB (32MB). The autocheckpoint
/// threshold is in pages (~4MB with 4KB pages).
const PER_CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    "PRAGMA cache_size = -32000",
    "PRAGMA temp_store = MEMORY",
];

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    for pragma in PER_CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// The WAL journal mode is persistent, but a file created by another tool
/// may still be in rollback mode.
async fn ensure_wal_mode(pool: &DbPool) -> Result<(), sqlx::Error> {
    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(pool)
        .await?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        tracing::warn!(journal_mode = %mode, "Journal mode is not WAL, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await?;
    }
    Ok(())
}

/// Pool size derived from the available cores, capped at [`DEFAULT_POOL_SIZE`].
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(DEFAULT_POOL_SIZE)
}

/// Initialize the connection pool with WAL mode and foreign keys enabled.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:noxqueue.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        // job_artifact rows cascade with their job
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    ensure_wal_mode(&pool).await?;

    tracing::info!(max_connections, "Database pool ready");

    Ok(pool)
}

/// Initialize the connection pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_pool_size()).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Database migrations applied");
    Ok(())
}

/// Open a migrated database file inside `dir`. Used by tests.
#[doc(hidden)]
pub async fn test_init_pool(dir: &std::path::Path) -> crate::Result<DbPool> {
    let url = format!("sqlite:{}?mode=rwc", dir.join("queue.db").display());
    let pool = init_pool_with_size(&url, 4).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
