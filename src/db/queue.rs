//! Durable outbound mutation queue.
//!
//! Every local write appends here in the same transaction that touches
//! the entity table, so the queue can never miss a mutation. Entries
//! coalesce per entity while still pending, drain in FIFO order with a
//! parent-before-child dependency rule, and dead-letter after
//! exhausting retries instead of being dropped.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

use super::{parse_id, parse_timestamp, StoreError};
use crate::models::{EntityType, NewQueueEntry, Operation, QueueEntry, QueueStatus};

pub(crate) const DEFAULT_MAX_RETRIES: i64 = 10;

#[derive(sqlx::FromRow)]
struct QueueRow {
    seq: i64,
    entity_id: String,
    entity_type: String,
    operation: String,
    payload: String,
    depends_on: String,
    retry_count: i64,
    next_eligible_at: String,
    status: String,
    enqueued_at: String,
    last_error: Option<String>,
}

impl QueueRow {
    fn hydrate(self) -> Result<QueueEntry, StoreError> {
        let depends_on: Vec<String> = serde_json::from_str(&self.depends_on)?;
        let depends_on = depends_on
            .iter()
            .map(|s| parse_id(s))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(QueueEntry {
            seq: self.seq,
            entity_id: parse_id(&self.entity_id)?,
            entity_type: EntityType::from_str(&self.entity_type).map_err(StoreError::Decode)?,
            operation: Operation::from_str(&self.operation).map_err(StoreError::Decode)?,
            payload: serde_json::from_str(&self.payload)?,
            depends_on,
            retry_count: self.retry_count,
            next_eligible_at: parse_timestamp(&self.next_eligible_at)?,
            status: QueueStatus::from_str(&self.status).map_err(StoreError::Decode)?,
            enqueued_at: parse_timestamp(&self.enqueued_at)?,
            last_error: self.last_error,
        })
    }
}

/// Appends or coalesces a queue entry inside the caller's transaction.
///
/// If a pending entry already exists for the same entity, its payload
/// is replaced in place (keeping its seq), so rapid repeated edits to
/// one entity produce one entry, not many. A pending create stays a
/// create when followed by updates; a delete supersedes either.
pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    entry: &NewQueueEntry,
) -> Result<(), StoreError> {
    let existing: Option<(i64, String, String)> = sqlx::query_as(
        "SELECT seq, operation, depends_on FROM outbound_queue WHERE entity_id = ? AND status = 'pending'",
    )
    .bind(entry.entity_id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    let payload = serde_json::to_string(&entry.payload)?;
    let depends_json = |ids: &[Uuid]| -> Result<String, StoreError> {
        Ok(serde_json::to_string(
            &ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        )?)
    };

    match existing {
        Some((seq, old_op, old_deps)) => {
            let old_op = Operation::from_str(&old_op).map_err(StoreError::Decode)?;
            let op = match (old_op, entry.operation) {
                (_, Operation::Delete) => Operation::Delete,
                (Operation::Create, _) => Operation::Create,
                (_, new_op) => new_op,
            };

            let mut deps: Vec<String> = serde_json::from_str(&old_deps)?;
            for id in &entry.depends_on {
                let s = id.to_string();
                if !deps.contains(&s) {
                    deps.push(s);
                }
            }

            sqlx::query(
                "UPDATE outbound_queue SET operation = ?, payload = ?, depends_on = ? WHERE seq = ?",
            )
            .bind(op.as_str())
            .bind(&payload)
            .bind(serde_json::to_string(&deps)?)
            .bind(seq)
            .execute(&mut *conn)
            .await?;
        }
        None => {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO outbound_queue (entity_id, entity_type, operation, payload, depends_on, retry_count, next_eligible_at, status, enqueued_at)
                VALUES (?, ?, ?, ?, ?, 0, ?, 'pending', ?)
                "#,
            )
            .bind(entry.entity_id.to_string())
            .bind(entry.entity_type.as_str())
            .bind(entry.operation.as_str())
            .bind(&payload)
            .bind(depends_json(&entry.depends_on)?)
            .bind(&now)
            .bind(&now)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(())
}

/// Delay before the next drain attempt: 2^n seconds plus up to 25%
/// jitter, capped at roughly 17 minutes.
fn backoff_delay(retry_count: i64) -> Duration {
    let exp = retry_count.clamp(0, 10) as u32;
    let base_secs = 1i64 << exp;
    let jitter_ms = rand::rng().random_range(0..=base_secs * 250);
    Duration::seconds(base_secs) + Duration::milliseconds(jitter_ms)
}

/// Handle for draining and acknowledging the outbound queue.
pub struct OutboundQueue {
    pool: SqlitePool,
    max_retries: i64,
}

impl OutboundQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Appends (or coalesces) an entry in its own transaction.
    ///
    /// Entity stores enqueue inside their own write transaction instead
    /// of calling this; it exists for callers outside the store layer.
    pub async fn push(&self, entry: &NewQueueEntry) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        enqueue(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Takes up to `batch_size` eligible entries in FIFO order and
    /// marks them in-flight.
    ///
    /// An entry whose `depends_on` references an entity with an
    /// undelivered create entry is skipped unless that create is
    /// already earlier in this batch, so a child row can never reach
    /// the remote store before its parent exists there.
    pub async fn drain(&self, batch_size: usize) -> Result<Vec<QueueEntry>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT * FROM outbound_queue WHERE status = 'pending' AND next_eligible_at <= ? ORDER BY seq",
        )
        .bind(&now)
        .fetch_all(&mut *tx)
        .await?;

        let undelivered_creates: Vec<(String,)> = sqlx::query_as(
            "SELECT entity_id FROM outbound_queue WHERE operation = 'create' AND status IN ('pending', 'in_flight')",
        )
        .fetch_all(&mut *tx)
        .await?;
        let blocked: HashSet<Uuid> = undelivered_creates
            .iter()
            .map(|(id,)| parse_id(id))
            .collect::<Result<_, _>>()?;

        let mut picked = Vec::new();
        let mut satisfied: HashSet<Uuid> = HashSet::new();
        for row in rows {
            let mut entry = row.hydrate()?;
            if entry
                .depends_on
                .iter()
                .any(|dep| blocked.contains(dep) && !satisfied.contains(dep))
            {
                continue;
            }
            if entry.operation == Operation::Create {
                satisfied.insert(entry.entity_id);
            }
            entry.status = QueueStatus::InFlight;
            picked.push(entry);
            if picked.len() == batch_size {
                break;
            }
        }

        for entry in &picked {
            sqlx::query("UPDATE outbound_queue SET status = 'in_flight' WHERE seq = ?")
                .bind(entry.seq)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(picked)
    }

    /// Delivery confirmed.
    pub async fn mark_done(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbound_queue SET status = 'done', last_error = NULL WHERE seq = ?")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Transient delivery failure: bump the retry count and push the
    /// next eligible time out with exponential backoff. Past
    /// `max_retries` the entry dead-letters instead.
    pub async fn mark_failed(&self, seq: i64, error: &str) -> Result<(), StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT retry_count FROM outbound_queue WHERE seq = ?")
                .bind(seq)
                .fetch_optional(&self.pool)
                .await?;
        let Some((retry_count,)) = row else {
            return Ok(());
        };

        let retries = retry_count + 1;
        if retries > self.max_retries {
            tracing::warn!(seq, retries, "queue entry exhausted retries, dead-lettering");
            self.mark_dead(seq, error).await
        } else {
            let eligible = Utc::now() + backoff_delay(retries);
            sqlx::query(
                "UPDATE outbound_queue SET status = 'pending', retry_count = ?, next_eligible_at = ?, last_error = ? WHERE seq = ?",
            )
            .bind(retries)
            .bind(eligible.to_rfc3339())
            .bind(error)
            .bind(seq)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }

    /// Permanent delivery failure: no retries, surfaced via
    /// `dead_letters` for manual handling.
    pub async fn mark_dead(&self, seq: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbound_queue SET status = 'dead_lettered', last_error = ? WHERE seq = ?",
        )
        .bind(error)
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Entries that gave up; kept until someone requeues or purges them.
    pub async fn dead_letters(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            "SELECT * FROM outbound_queue WHERE status = 'dead_lettered' ORDER BY seq",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(QueueRow::hydrate).collect()
    }

    /// Manual intervention hook: put a dead-lettered entry back in play.
    pub async fn requeue_dead_letter(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbound_queue SET status = 'pending', retry_count = 0, next_eligible_at = ?, last_error = NULL WHERE seq = ? AND status = 'dead_lettered'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(seq)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns in-flight entries to pending. Called on startup so a
    /// batch interrupted by shutdown or crash is retried.
    pub async fn requeue_in_flight(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE outbound_queue SET status = 'pending' WHERE status = 'in_flight'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Drops confirmed entries.
    pub async fn purge_done(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM outbound_queue WHERE status = 'done'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Full queue contents for inspection and debugging.
    pub async fn entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<QueueRow> = sqlx::query_as("SELECT * FROM outbound_queue ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(QueueRow::hydrate).collect()
    }

    pub async fn entries_for(&self, entity_id: Uuid) -> Result<Vec<QueueEntry>, StoreError> {
        let rows: Vec<QueueRow> =
            sqlx::query_as("SELECT * FROM outbound_queue WHERE entity_id = ? ORDER BY seq")
                .bind(entity_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(QueueRow::hydrate).collect()
    }
}
