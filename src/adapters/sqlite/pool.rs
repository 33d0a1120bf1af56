//! Pool construction for the SQLite-backed stores.
//!
//! Failures surface as [`OrchestrationError::Database`] like every other
//! store error; callers get one taxonomy, not an adapter-private one.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::domain::errors::{OrchResult, OrchestrationError};

/// Tunables for a file-backed pool.
#[derive(Debug, Clone, Copy)]
pub struct SqliteOptions {
    pub max_connections: u32,
    /// How long a writer waits on the database lock before giving up.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self { max_connections: 4, busy_timeout: Duration::from_secs(30) }
    }
}

/// Open a pool against `url` (`sqlite:path/to/core.db`), creating the file
/// and its directory when missing. WAL journaling keeps readers off the
/// writer's lock.
pub async fn connect(url: &str, options: SqliteOptions) -> OrchResult<SqlitePool> {
    if let Some(path) = file_path(url) {
        prepare_directory(path)?;
    }

    let connect_options = SqliteConnectOptions::from_str(url)
        .map_err(|e| OrchestrationError::InvalidInput(format!("bad database url '{url}': {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(options.busy_timeout);

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

/// Open an in-memory database for tests.
///
/// A SQLite in-memory database is private to its connection, so the pool is
/// pinned to exactly one; pooling more would hand each caller an empty
/// database of its own.
pub async fn connect_in_memory() -> OrchResult<SqlitePool> {
    let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| OrchestrationError::Database(e.to_string()))?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options)
        .await?;
    Ok(pool)
}

/// The filesystem path inside a `sqlite:` url, when it names a file rather
/// than `:memory:`.
fn file_path(url: &str) -> Option<&str> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    (!path.is_empty() && !path.starts_with(':')).then_some(path)
}

fn prepare_directory(path: &str) -> OrchResult<()> {
    let Some(dir) = Path::new(path).parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| {
        OrchestrationError::Database(format!("cannot create database directory for '{path}': {e}"))
    })
}
