use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::{parse_timestamp, StoreError};

/// Persisted pull checkpoint: the marker up to which remote changes
/// have been fully incorporated. Advanced only after a pull cycle
/// applies cleanly, so a failed pull replays from the old marker.
pub struct CheckpointStore {
    pool: SqlitePool,
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT pull_checkpoint FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        match row.and_then(|(cp,)| cp) {
            Some(s) => Ok(Some(parse_timestamp(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, checkpoint: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_state SET pull_checkpoint = ? WHERE id = 1")
            .bind(checkpoint.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
