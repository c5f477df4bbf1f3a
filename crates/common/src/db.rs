use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::StoreError;

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Open the SQLite store at `path`, creating and migrating it as needed.
///
/// If the existing file cannot be opened or migrated (corruption, foreign
/// file, partial write) it is removed together with its WAL/SHM siblings and
/// recreated once. Dedup and health history is lost in that case; only a
/// failure of the recreated store is returned as an error.
pub async fn open_store(path: &Path, max_connections: u32) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::Reset {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
    }

    match initialize(path, max_connections).await {
        Ok(pool) => Ok(pool),
        Err(first) => {
            tracing::warn!(
                path = %path.display(),
                error = %first,
                "Store could not be opened, resetting it"
            );
            remove_store_files(path).await;

            let pool = initialize(path, max_connections)
                .await
                .map_err(|e| StoreError::Reset {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;

            tracing::warn!(
                path = %path.display(),
                "Store was corrupted and has been reset. Dedup history lost, some items may be re-sent"
            );
            Ok(pool)
        }
    }
}

/// Open a migrated in-memory store.
///
/// The pool holds exactly one connection that is never recycled, since every
/// in-memory connection is its own database.
pub async fn open_in_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

async fn initialize(path: &Path, max_connections: u32) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    if let Err(e) = MIGRATOR.run(&pool).await {
        pool.close().await;
        return Err(e.into());
    }

    tracing::debug!(path = %path.display(), max_connections, "Connected to SQLite store");
    Ok(pool)
}

async fn remove_store_files(path: &Path) {
    let base = path.display().to_string();
    for candidate in [base.clone(), format!("{base}-wal"), format!("{base}-shm")] {
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %candidate, error = %e, "Failed to remove store file"),
        }
    }
}
