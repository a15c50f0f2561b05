mod boards;
mod checkpoint;
mod composites;
mod queue;
mod snapshots;
mod tasks;

pub use boards::BoardStore;
pub use checkpoint::CheckpointStore;
pub use composites::CompositeStore;
pub use queue::OutboundQueue;
pub use snapshots::SnapshotStore;
pub use tasks::TaskStore;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Errors from the local entity store.
#[derive(Debug)]
pub enum StoreError {
    /// Malformed entity rejected at the write boundary; never queued.
    Validation(String),
    /// Underlying SQLite failure.
    Database(sqlx::Error),
    /// A stored row could not be decoded back into an entity.
    Decode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "Validation error: {}", msg),
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Decode(msg) => write!(f, "Decode error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

/// Initialize the database connection pool and run migrations.
pub async fn init_db(db_path: Option<PathBuf>) -> Result<SqlitePool, sqlx::Error> {
    let path = db_path.expect("database_path must be provided");

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create database directory");
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub(crate) fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp '{}': {}", s, e)))
}

pub(crate) fn parse_opt_timestamp(s: &Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_id(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Decode(format!("bad uuid '{}': {}", s, e)))
}

#[cfg(test)]
pub(crate) async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let pool = init_db(Some(db_path)).await.unwrap();
    (temp_dir, pool)
}
