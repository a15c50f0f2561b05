//! Generic snapshot read/write used by the sync engine.
//!
//! Local snapshots feed the conflict resolver; `apply_remote` writes a
//! winning remote snapshot into the local tables without touching the
//! outbound queue (remote data is already synced, echoing it back
//! would loop forever).

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{BoardStore, CompositeStore, StoreError, TaskStore};
use crate::models::{
    Board, BoardPlacement, CompositeNode, CompositeTask, EntitySnapshot, EntityType, Task,
};

pub struct SnapshotStore {
    pool: SqlitePool,
    tasks: TaskStore,
    boards: BoardStore,
    composites: CompositeStore,
}

fn envelope<T: Serialize>(
    entity_type: EntityType,
    id: Uuid,
    owner_id: &str,
    version: i64,
    updated_at: chrono::DateTime<Utc>,
    deleted: bool,
    entity: &T,
) -> Result<EntitySnapshot, StoreError> {
    Ok(EntitySnapshot {
        id,
        entity_type,
        owner_id: owner_id.to_string(),
        version,
        updated_at,
        deleted,
        payload: serde_json::to_value(entity)?,
    })
}

impl SnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            tasks: TaskStore::new(pool.clone()),
            boards: BoardStore::new(pool.clone()),
            composites: CompositeStore::new(pool.clone()),
            pool,
        }
    }

    /// The local copy of an entity in resolver shape, if present.
    pub async fn local_snapshot(
        &self,
        entity_type: EntityType,
        id: Uuid,
    ) -> Result<Option<EntitySnapshot>, StoreError> {
        let snap = match entity_type {
            EntityType::Task => match self.tasks.get(id).await? {
                Some(t) => Some(envelope(
                    entity_type, t.id, &t.owner_id, t.version, t.updated_at, t.deleted, &t,
                )?),
                None => None,
            },
            EntityType::Board => match self.boards.get_board(id).await? {
                Some(b) => Some(envelope(
                    entity_type, b.id, &b.owner_id, b.version, b.updated_at, b.deleted, &b,
                )?),
                None => None,
            },
            EntityType::Placement => match self.boards.get_placement(id).await? {
                Some(p) => Some(envelope(
                    entity_type, p.id, &p.owner_id, p.version, p.updated_at, p.deleted, &p,
                )?),
                None => None,
            },
            EntityType::CompositeTask => match self.composites.get(id).await? {
                Some(c) => Some(envelope(
                    entity_type, c.id, &c.owner_id, c.version, c.updated_at, c.deleted, &c,
                )?),
                None => None,
            },
            EntityType::CompositeNode => match self.composites.get_node(id).await? {
                Some(n) => Some(envelope(
                    entity_type, n.id, &n.owner_id, n.version, n.updated_at, n.deleted, &n,
                )?),
                None => None,
            },
        };
        Ok(snap)
    }

    /// Upserts a remote snapshot into the local table, trusting the
    /// envelope's version and timestamps. No queue entry is written.
    pub async fn apply_remote(&self, snap: &EntitySnapshot) -> Result<(), StoreError> {
        let synced_at = Utc::now().to_rfc3339();
        match snap.entity_type {
            EntityType::Task => {
                let task: Task = serde_json::from_value(snap.payload.clone())?;
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO tasks (id, owner_id, title, kind, version, updated_at, deleted, deleted_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(snap.id.to_string())
                .bind(&snap.owner_id)
                .bind(&task.title)
                .bind(serde_json::to_string(&task.kind)?)
                .bind(snap.version)
                .bind(snap.updated_at.to_rfc3339())
                .bind(snap.deleted)
                .bind(task.deleted_at.map(|t| t.to_rfc3339()))
                .bind(&synced_at)
                .execute(&self.pool)
                .await?;
            }
            EntityType::Board => {
                let board: Board = serde_json::from_value(snap.payload.clone())?;
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO boards (id, owner_id, name, size, completed_line_count, full_board, version, updated_at, deleted, deleted_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(snap.id.to_string())
                .bind(&snap.owner_id)
                .bind(&board.name)
                .bind(board.size.dimension() as i64)
                .bind(board.completed_line_count)
                .bind(board.full_board)
                .bind(snap.version)
                .bind(snap.updated_at.to_rfc3339())
                .bind(snap.deleted)
                .bind(board.deleted_at.map(|t| t.to_rfc3339()))
                .bind(&synced_at)
                .execute(&self.pool)
                .await?;
            }
            EntityType::Placement => {
                let placement: BoardPlacement = serde_json::from_value(snap.payload.clone())?;
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO placements (id, owner_id, board_id, position, task_id, composite_id, completed, current_count, version, updated_at, deleted, deleted_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(snap.id.to_string())
                .bind(&snap.owner_id)
                .bind(placement.board_id.to_string())
                .bind(placement.position)
                .bind(placement.task_id().map(|id| id.to_string()))
                .bind(placement.composite_id().map(|id| id.to_string()))
                .bind(placement.completed)
                .bind(placement.current_count)
                .bind(snap.version)
                .bind(snap.updated_at.to_rfc3339())
                .bind(snap.deleted)
                .bind(placement.deleted_at.map(|t| t.to_rfc3339()))
                .bind(&synced_at)
                .execute(&self.pool)
                .await?;
            }
            EntityType::CompositeTask => {
                let composite: CompositeTask = serde_json::from_value(snap.payload.clone())?;
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO composite_tasks (id, owner_id, name, root_node_id, version, updated_at, deleted, deleted_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(snap.id.to_string())
                .bind(&snap.owner_id)
                .bind(&composite.name)
                .bind(composite.root_node_id.to_string())
                .bind(snap.version)
                .bind(snap.updated_at.to_rfc3339())
                .bind(snap.deleted)
                .bind(composite.deleted_at.map(|t| t.to_rfc3339()))
                .bind(&synced_at)
                .execute(&self.pool)
                .await?;
            }
            EntityType::CompositeNode => {
                let node: CompositeNode = serde_json::from_value(snap.payload.clone())?;
                sqlx::query(
                    r#"
                    INSERT OR REPLACE INTO composite_nodes (id, owner_id, composite_id, parent_id, order_index, kind, version, updated_at, deleted, deleted_at, last_synced_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(snap.id.to_string())
                .bind(&snap.owner_id)
                .bind(node.composite_id.to_string())
                .bind(node.parent_id.map(|id| id.to_string()))
                .bind(node.order_index)
                .bind(serde_json::to_string(&node.kind)?)
                .bind(snap.version)
                .bind(snap.updated_at.to_rfc3339())
                .bind(snap.deleted)
                .bind(node.deleted_at.map(|t| t.to_rfc3339()))
                .bind(&synced_at)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Records delivery of a local entity to the remote store.
    pub async fn stamp_synced(
        &self,
        entity_type: EntityType,
        id: Uuid,
    ) -> Result<(), StoreError> {
        let table = match entity_type {
            EntityType::Task => "tasks",
            EntityType::Board => "boards",
            EntityType::Placement => "placements",
            EntityType::CompositeTask => "composite_tasks",
            EntityType::CompositeNode => "composite_nodes",
        };
        let sql = format!("UPDATE {} SET last_synced_at = ? WHERE id = ?", table);
        sqlx::query(&sql)
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_local_snapshot_round_trip() {
        let (_tmp, pool) = test_pool().await;
        let tasks = TaskStore::new(pool.clone());
        let snapshots = SnapshotStore::new(pool);

        let task = tasks.create(&Task::new("Stretch", "user1")).await.unwrap();
        let snap = snapshots
            .local_snapshot(EntityType::Task, task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(snap.payload["title"], "Stretch");
    }

    #[tokio::test]
    async fn test_apply_remote_inserts_without_queueing() {
        let (_tmp, pool) = test_pool().await;
        let tasks = TaskStore::new(pool.clone());
        let queue = crate::db::OutboundQueue::new(pool.clone());
        let snapshots = SnapshotStore::new(pool);

        let mut task = Task::new("From another device", "user1");
        task.version = 4;
        let snap = envelope(
            EntityType::Task,
            task.id,
            &task.owner_id,
            task.version,
            task.updated_at,
            false,
            &task,
        )
        .unwrap();

        snapshots.apply_remote(&snap).await.unwrap();

        let fetched = tasks.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.version, 4);
        assert!(fetched.last_synced_at.is_some());
        assert!(queue.entries_for(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_remote_overwrites_local() {
        let (_tmp, pool) = test_pool().await;
        let tasks = TaskStore::new(pool.clone());
        let snapshots = SnapshotStore::new(pool);

        let local = tasks.create(&Task::new("Local title", "user1")).await.unwrap();

        let mut remote = local.clone();
        remote.title = "Remote title".to_string();
        remote.version = 7;
        let snap = envelope(
            EntityType::Task,
            remote.id,
            &remote.owner_id,
            remote.version,
            remote.updated_at,
            false,
            &remote,
        )
        .unwrap();
        snapshots.apply_remote(&snap).await.unwrap();

        let fetched = tasks.get(local.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Remote title");
        assert_eq!(fetched.version, 7);
    }
}
