use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_id, parse_opt_timestamp, parse_timestamp, queue, StoreError};
use crate::models::{EntityType, NewQueueEntry, Operation, Task, TaskKind};

pub struct TaskStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    owner_id: String,
    title: String,
    kind: String,
    version: i64,
    updated_at: String,
    deleted: bool,
    deleted_at: Option<String>,
    last_synced_at: Option<String>,
}

impl TaskRow {
    fn hydrate(self) -> Result<Task, StoreError> {
        Ok(Task {
            id: parse_id(&self.id)?,
            owner_id: self.owner_id,
            title: self.title,
            kind: serde_json::from_str(&self.kind)?,
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
            deleted_at: parse_opt_timestamp(&self.deleted_at)?,
            last_synced_at: parse_opt_timestamp(&self.last_synced_at)?,
        })
    }
}

fn queue_entry(task: &Task, op: Operation) -> Result<NewQueueEntry, StoreError> {
    // A multi-step task must not reach the remote before its steps
    let depends_on = match &task.kind {
        TaskKind::MultiStep { step_ids } => step_ids.clone(),
        _ => Vec::new(),
    };
    Ok(NewQueueEntry {
        entity_id: task.id,
        entity_type: EntityType::Task,
        operation: op,
        payload: serde_json::to_value(task)?,
        depends_on,
    })
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Steps of a multi-step task must exist and must not themselves
    /// be multi-step (no nesting).
    async fn validate_kind(&self, kind: &TaskKind) -> Result<(), StoreError> {
        if let TaskKind::MultiStep { step_ids } = kind {
            for step_id in step_ids {
                let step = self.get(*step_id).await?.ok_or_else(|| {
                    StoreError::Validation(format!("step task {} does not exist", step_id))
                })?;
                if step.kind.is_multi_step() {
                    return Err(StoreError::Validation(format!(
                        "step task {} is multi-step; steps cannot nest",
                        step_id
                    )));
                }
            }
        }
        Ok(())
    }

    pub async fn create(&self, task: &Task) -> Result<Task, StoreError> {
        self.validate_kind(&task.kind).await?;

        let mut task = task.clone();
        task.version = 1;
        task.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            r#"
            INSERT INTO tasks (id, owner_id, title, kind, version, updated_at, deleted, deleted_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.owner_id)
        .bind(&task.title)
        .bind(serde_json::to_string(&task.kind)?)
        .bind(task.version)
        .bind(task.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                return Err(StoreError::Validation(format!(
                    "task {} already exists",
                    task.id
                )));
            }
            return Err(e.into());
        }

        queue::enqueue(&mut tx, &queue_entry(&task, Operation::Create)?).await?;
        tx.commit().await?;

        Ok(task)
    }

    /// Writes changed content fields, bumping version once. A write
    /// that changes nothing is a no-op: no version bump, no queue
    /// entry, so resent identical edits never cause conflict churn.
    pub async fn update(&self, task: &Task) -> Result<Task, StoreError> {
        self.validate_kind(&task.kind).await?;

        let mut tx = self.pool.begin().await?;
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(task.id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let stored = row
            .ok_or_else(|| StoreError::Validation(format!("unknown task {}", task.id)))?
            .hydrate()?;

        if stored.content_eq(task) {
            tx.commit().await?;
            return Ok(stored);
        }

        let mut updated = task.clone();
        updated.version = stored.version + 1;
        updated.updated_at = Utc::now();
        updated.last_synced_at = stored.last_synced_at;

        sqlx::query(
            "UPDATE tasks SET title = ?, kind = ?, version = ?, updated_at = ?, deleted = ?, deleted_at = ? WHERE id = ?",
        )
        .bind(&updated.title)
        .bind(serde_json::to_string(&updated.kind)?)
        .bind(updated.version)
        .bind(updated.updated_at.to_rfc3339())
        .bind(updated.deleted)
        .bind(updated.deleted_at.map(|t| t.to_rfc3339()))
        .bind(updated.id.to_string())
        .execute(&mut *tx)
        .await?;

        queue::enqueue(&mut tx, &queue_entry(&updated, Operation::Update)?).await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Lookup by id; returns soft-deleted tasks with the flag set.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskRow::hydrate).transpose()
    }

    /// Active tasks only.
    pub async fn list(&self) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> =
            sqlx::query_as("SELECT * FROM tasks WHERE deleted = 0 ORDER BY title")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TaskRow::hydrate).collect()
    }

    pub async fn list_all(&self) -> Result<Vec<Task>, StoreError> {
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks ORDER BY title")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TaskRow::hydrate).collect()
    }

    /// Sets the delete flag; the row stays in place.
    pub async fn soft_delete(&self, id: Uuid) -> Result<(), StoreError> {
        let stored = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown task {}", id)))?;
        if stored.deleted {
            return Ok(());
        }

        let mut deleted = stored;
        deleted.deleted = true;
        deleted.deleted_at = Some(Utc::now());
        deleted.version += 1;
        deleted.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE tasks SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(deleted.deleted_at.map(|t| t.to_rfc3339()))
        .bind(deleted.version)
        .bind(deleted.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        queue::enqueue(&mut tx, &queue_entry(&deleted, Operation::Delete)?).await?;
        tx.commit().await?;

        Ok(())
    }
}
