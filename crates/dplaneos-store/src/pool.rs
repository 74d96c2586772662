use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::error::StoreError;

/// Opens the WAL-mode SQLite pool backing the entire control plane.
///
/// A single process owns this database; `max_connections` stays small
/// because SQLite serializes writers regardless of pool size, and a large
/// pool only adds lock contention under `busy_timeout`.
pub async fn open(db_path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))
        .map_err(sqlx::Error::from)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(30))
        .foreign_keys(true)
        .shared_cache(true)
        .pragma("wal_autocheckpoint", "1000");

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&pool)
        .await?;

    info!(path = %db_path.display(), "opened control-plane database");
    Ok(pool)
}

/// Runs `PRAGMA integrity_check` and logs a warning rather than aborting —
/// a single damaged page shouldn't keep the whole control plane from
/// booting when the rest of the database is usable.
pub async fn integrity_check(pool: &SqlitePool) -> Result<(), StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
        .fetch_all(pool)
        .await?;
    let ok = rows.len() == 1 && rows[0].0 == "ok";
    if !ok {
        let detail = rows.into_iter().map(|(r,)| r).collect::<Vec<_>>().join("; ");
        tracing::warn!(detail = %detail, "database integrity check reported problems");
    }
    Ok(())
}

/// `PASSIVE` checkpoint, run on the 5-minute maintenance tick. Passive mode
/// never blocks other connections, unlike `TRUNCATE`/`RESTART`.
pub async fn checkpoint_passive(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query("PRAGMA wal_checkpoint(PASSIVE)").execute(pool).await?;
    Ok(())
}

/// Writes a consistent on-disk copy via `VACUUM INTO`, used for the
/// startup backup and the 24h backup tick.
pub async fn backup_into(pool: &SqlitePool, dest: &Path) -> Result<(), StoreError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let dest_str = dest.display().to_string();
    sqlx::query("VACUUM INTO ?").bind(dest_str).execute(pool).await?;
    Ok(())
}
