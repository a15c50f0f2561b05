use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{parse_id, parse_opt_timestamp, parse_timestamp, queue, StoreError};
use crate::models::{
    Board, BoardPlacement, BoardSize, EntityType, NewQueueEntry, Operation, PlacementRef, TaskKind,
};

pub struct BoardStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct BoardRow {
    id: String,
    owner_id: String,
    name: String,
    size: i64,
    completed_line_count: i64,
    full_board: bool,
    version: i64,
    updated_at: String,
    deleted: bool,
    deleted_at: Option<String>,
    last_synced_at: Option<String>,
}

impl BoardRow {
    fn hydrate(self) -> Result<Board, StoreError> {
        Ok(Board {
            id: parse_id(&self.id)?,
            owner_id: self.owner_id,
            name: self.name,
            size: BoardSize::try_from(self.size as u8).map_err(StoreError::Decode)?,
            completed_line_count: self.completed_line_count,
            full_board: self.full_board,
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
            deleted_at: parse_opt_timestamp(&self.deleted_at)?,
            last_synced_at: parse_opt_timestamp(&self.last_synced_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlacementRow {
    id: String,
    owner_id: String,
    board_id: String,
    position: i64,
    task_id: Option<String>,
    composite_id: Option<String>,
    completed: bool,
    current_count: i64,
    version: i64,
    updated_at: String,
    deleted: bool,
    deleted_at: Option<String>,
    last_synced_at: Option<String>,
}

impl PlacementRow {
    fn hydrate(self) -> Result<BoardPlacement, StoreError> {
        let target = match (&self.task_id, &self.composite_id) {
            (Some(task_id), None) => PlacementRef::Task(parse_id(task_id)?),
            (None, Some(composite_id)) => PlacementRef::Composite(parse_id(composite_id)?),
            _ => {
                return Err(StoreError::Decode(format!(
                    "placement {} has no single target reference",
                    self.id
                )))
            }
        };
        Ok(BoardPlacement {
            id: parse_id(&self.id)?,
            owner_id: self.owner_id,
            board_id: parse_id(&self.board_id)?,
            position: self.position,
            target,
            completed: self.completed,
            current_count: self.current_count,
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
            deleted_at: parse_opt_timestamp(&self.deleted_at)?,
            last_synced_at: parse_opt_timestamp(&self.last_synced_at)?,
        })
    }
}

fn board_queue_entry(board: &Board, op: Operation) -> Result<NewQueueEntry, StoreError> {
    Ok(NewQueueEntry {
        entity_id: board.id,
        entity_type: EntityType::Board,
        operation: op,
        payload: serde_json::to_value(board)?,
        depends_on: Vec::new(),
    })
}

fn placement_queue_entry(
    placement: &BoardPlacement,
    op: Operation,
) -> Result<NewQueueEntry, StoreError> {
    let target_id = match placement.target {
        PlacementRef::Task(id) => id,
        PlacementRef::Composite(id) => id,
    };
    Ok(NewQueueEntry {
        entity_id: placement.id,
        entity_type: EntityType::Placement,
        operation: op,
        payload: serde_json::to_value(placement)?,
        depends_on: vec![placement.board_id, target_id],
    })
}

impl BoardStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_board(&self, board: &Board) -> Result<Board, StoreError> {
        let mut board = board.clone();
        board.version = 1;
        board.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            r#"
            INSERT INTO boards (id, owner_id, name, size, completed_line_count, full_board, version, updated_at, deleted, deleted_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(board.id.to_string())
        .bind(&board.owner_id)
        .bind(&board.name)
        .bind(board.size.dimension() as i64)
        .bind(board.completed_line_count)
        .bind(board.full_board)
        .bind(board.version)
        .bind(board.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                return Err(StoreError::Validation(format!(
                    "board {} already exists",
                    board.id
                )));
            }
            return Err(e.into());
        }

        queue::enqueue(&mut tx, &board_queue_entry(&board, Operation::Create)?).await?;
        tx.commit().await?;

        Ok(board)
    }

    pub async fn get_board(&self, id: Uuid) -> Result<Option<Board>, StoreError> {
        let row: Option<BoardRow> = sqlx::query_as("SELECT * FROM boards WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(BoardRow::hydrate).transpose()
    }

    pub async fn list_boards(&self) -> Result<Vec<Board>, StoreError> {
        let rows: Vec<BoardRow> =
            sqlx::query_as("SELECT * FROM boards WHERE deleted = 0 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(BoardRow::hydrate).collect()
    }

    pub async fn update_board(&self, board: &Board) -> Result<Board, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<BoardRow> = sqlx::query_as("SELECT * FROM boards WHERE id = ?")
            .bind(board.id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let stored = row
            .ok_or_else(|| StoreError::Validation(format!("unknown board {}", board.id)))?
            .hydrate()?;

        if stored.content_eq(board) {
            tx.commit().await?;
            return Ok(stored);
        }

        let mut updated = board.clone();
        updated.version = stored.version + 1;
        updated.updated_at = Utc::now();
        updated.last_synced_at = stored.last_synced_at;

        sqlx::query(
            r#"
            UPDATE boards SET name = ?, size = ?, completed_line_count = ?, full_board = ?, version = ?, updated_at = ?, deleted = ?, deleted_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&updated.name)
        .bind(updated.size.dimension() as i64)
        .bind(updated.completed_line_count)
        .bind(updated.full_board)
        .bind(updated.version)
        .bind(updated.updated_at.to_rfc3339())
        .bind(updated.deleted)
        .bind(updated.deleted_at.map(|t| t.to_rfc3339()))
        .bind(updated.id.to_string())
        .execute(&mut *tx)
        .await?;

        queue::enqueue(&mut tx, &board_queue_entry(&updated, Operation::Update)?).await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Rewrites the cached line-detector output. Returns whether the
    /// cache actually changed; unchanged values bump nothing.
    pub async fn update_board_cache(
        &self,
        board_id: Uuid,
        completed_line_count: i64,
        full_board: bool,
    ) -> Result<bool, StoreError> {
        let stored = self
            .get_board(board_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown board {}", board_id)))?;
        if stored.completed_line_count == completed_line_count && stored.full_board == full_board {
            return Ok(false);
        }

        let mut updated = stored;
        updated.completed_line_count = completed_line_count;
        updated.full_board = full_board;
        self.update_board(&updated).await?;
        Ok(true)
    }

    pub async fn soft_delete_board(&self, id: Uuid) -> Result<(), StoreError> {
        let stored = self
            .get_board(id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown board {}", id)))?;
        if stored.deleted {
            return Ok(());
        }

        let mut board = stored;
        board.deleted = true;
        board.deleted_at = Some(Utc::now());
        board.version += 1;
        board.updated_at = Utc::now();

        let placements = self.placements_for_board(id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE boards SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(board.deleted_at.map(|t| t.to_rfc3339()))
        .bind(board.version)
        .bind(board.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        queue::enqueue(&mut tx, &board_queue_entry(&board, Operation::Delete)?).await?;

        for placement in placements {
            let mut placement = placement;
            placement.deleted = true;
            placement.deleted_at = board.deleted_at;
            placement.version += 1;
            placement.updated_at = board.updated_at;
            sqlx::query(
                "UPDATE placements SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
            )
            .bind(placement.deleted_at.map(|t| t.to_rfc3339()))
            .bind(placement.version)
            .bind(placement.updated_at.to_rfc3339())
            .bind(placement.id.to_string())
            .execute(&mut *tx)
            .await?;
            queue::enqueue(
                &mut tx,
                &placement_queue_entry(&placement, Operation::Delete)?,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Places a task or composite on a board cell.
    pub async fn place(&self, placement: &BoardPlacement) -> Result<BoardPlacement, StoreError> {
        let board = self
            .get_board(placement.board_id)
            .await?
            .ok_or_else(|| {
                StoreError::Validation(format!("unknown board {}", placement.board_id))
            })?;
        if board.deleted {
            return Err(StoreError::Validation(format!(
                "board {} is deleted",
                board.id
            )));
        }
        let cells = board.size.cell_count() as i64;
        if placement.position < 0 || placement.position >= cells {
            return Err(StoreError::Validation(format!(
                "position {} out of range for a {} board",
                placement.position, board.size
            )));
        }

        let mut placement = placement.clone();
        placement.version = 1;
        placement.updated_at = Utc::now();

        // Occupancy is checked inside the insert transaction and backed
        // by the partial unique index on (board_id, position), so two
        // racing placements for the same cell cannot both land.
        let mut tx = self.pool.begin().await?;
        let occupied: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM placements WHERE board_id = ? AND position = ? AND deleted = 0",
        )
        .bind(placement.board_id.to_string())
        .bind(placement.position)
        .fetch_optional(&mut *tx)
        .await?;
        if occupied.is_some() {
            return Err(StoreError::Validation(format!(
                "position {} on board {} is already occupied",
                placement.position, board.id
            )));
        }

        let insert = sqlx::query(
            r#"
            INSERT INTO placements (id, owner_id, board_id, position, task_id, composite_id, completed, current_count, version, updated_at, deleted, deleted_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(placement.id.to_string())
        .bind(&placement.owner_id)
        .bind(placement.board_id.to_string())
        .bind(placement.position)
        .bind(placement.task_id().map(|id| id.to_string()))
        .bind(placement.composite_id().map(|id| id.to_string()))
        .bind(placement.completed)
        .bind(placement.current_count)
        .bind(placement.version)
        .bind(placement.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                return Err(StoreError::Validation(format!(
                    "position {} on board {} is already occupied",
                    placement.position, board.id
                )));
            }
            return Err(e.into());
        }

        queue::enqueue(
            &mut tx,
            &placement_queue_entry(&placement, Operation::Create)?,
        )
        .await?;
        tx.commit().await?;

        Ok(placement)
    }

    pub async fn get_placement(&self, id: Uuid) -> Result<Option<BoardPlacement>, StoreError> {
        let row: Option<PlacementRow> = sqlx::query_as("SELECT * FROM placements WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(PlacementRow::hydrate).transpose()
    }

    /// Active placements for one board, in cell order.
    pub async fn placements_for_board(
        &self,
        board_id: Uuid,
    ) -> Result<Vec<BoardPlacement>, StoreError> {
        let rows: Vec<PlacementRow> = sqlx::query_as(
            "SELECT * FROM placements WHERE board_id = ? AND deleted = 0 ORDER BY position",
        )
        .bind(board_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PlacementRow::hydrate).collect()
    }

    /// Active placements referencing a composite task, across boards.
    pub async fn placements_for_composite(
        &self,
        composite_id: Uuid,
    ) -> Result<Vec<BoardPlacement>, StoreError> {
        let rows: Vec<PlacementRow> = sqlx::query_as(
            "SELECT * FROM placements WHERE composite_id = ? AND deleted = 0 ORDER BY position",
        )
        .bind(composite_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PlacementRow::hydrate).collect()
    }

    /// Flips completion on one cell. Other placements of the same task
    /// on other boards are untouched.
    pub async fn set_completed(
        &self,
        placement_id: Uuid,
        completed: bool,
    ) -> Result<BoardPlacement, StoreError> {
        let stored = self
            .get_placement(placement_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown placement {}", placement_id)))?;
        if stored.completed == completed {
            return Ok(stored);
        }

        let mut updated = stored;
        updated.completed = completed;
        self.write_placement(&updated).await
    }

    /// Advances a quantified placement's counter; completion derives
    /// from reaching the task's target count.
    pub async fn increment_count(
        &self,
        placement_id: Uuid,
        delta: i64,
    ) -> Result<BoardPlacement, StoreError> {
        let stored = self
            .get_placement(placement_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown placement {}", placement_id)))?;

        let task_id = stored.task_id().ok_or_else(|| {
            StoreError::Validation("cannot increment a composite placement".to_string())
        })?;
        let task_row: Option<(String,)> = sqlx::query_as("SELECT kind FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let kind: TaskKind = match task_row {
            Some((kind_json,)) => serde_json::from_str(&kind_json)?,
            None => {
                return Err(StoreError::Validation(format!(
                    "unknown task {} behind placement",
                    task_id
                )))
            }
        };
        let TaskKind::Quantified { target_count, .. } = kind else {
            return Err(StoreError::Validation(format!(
                "task {} is not quantified",
                task_id
            )));
        };

        let mut updated = stored.clone();
        updated.current_count = (stored.current_count + delta).max(0);
        updated.completed = updated.current_count >= target_count;
        if updated.content_eq(&stored) {
            return Ok(stored);
        }
        self.write_placement(&updated).await
    }

    async fn write_placement(
        &self,
        placement: &BoardPlacement,
    ) -> Result<BoardPlacement, StoreError> {
        let mut updated = placement.clone();
        updated.version += 1;
        updated.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE placements SET completed = ?, current_count = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(updated.completed)
        .bind(updated.current_count)
        .bind(updated.version)
        .bind(updated.updated_at.to_rfc3339())
        .bind(updated.id.to_string())
        .execute(&mut *tx)
        .await?;

        queue::enqueue(
            &mut tx,
            &placement_queue_entry(&updated, Operation::Update)?,
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, OutboundQueue, TaskStore};
    use crate::models::Task;

    async fn seed_board(
        boards: &BoardStore,
        tasks: &TaskStore,
    ) -> (Board, Task, BoardPlacement) {
        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let task = tasks.create(&Task::new("Stretch", "user1")).await.unwrap();
        let placement = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();
        (board, task, placement)
    }

    #[tokio::test]
    async fn test_place_and_complete() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let (_board, _task, placement) = seed_board(&boards, &tasks).await;
        let done = boards.set_completed(placement.id, true).await.unwrap();
        assert!(done.completed);
        assert_eq!(done.version, 2);
    }

    #[tokio::test]
    async fn test_set_completed_is_idempotent() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let (_board, _task, placement) = seed_board(&boards, &tasks).await;
        boards.set_completed(placement.id, true).await.unwrap();
        let again = boards.set_completed(placement.id, true).await.unwrap();
        assert_eq!(again.version, 2);
    }

    #[tokio::test]
    async fn test_completion_is_per_board() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let task = tasks.create(&Task::new("Stretch", "user1")).await.unwrap();
        let board_a = boards
            .create_board(&Board::new("A", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let board_b = boards
            .create_board(&Board::new("B", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let on_a = boards
            .place(&BoardPlacement::new(
                board_a.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();
        let on_b = boards
            .place(&BoardPlacement::new(
                board_b.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();

        boards.set_completed(on_a.id, true).await.unwrap();
        assert!(boards.get_placement(on_a.id).await.unwrap().unwrap().completed);
        assert!(!boards.get_placement(on_b.id).await.unwrap().unwrap().completed);
    }

    #[tokio::test]
    async fn test_position_out_of_range_rejected() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let task = tasks.create(&Task::new("Stretch", "user1")).await.unwrap();
        let placement = BoardPlacement::new(board.id, 9, PlacementRef::Task(task.id), "user1");
        assert!(matches!(
            boards.place(&placement).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_occupied_position_rejected() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let (board, task, _placement) = seed_board(&boards, &tasks).await;
        let second = BoardPlacement::new(board.id, 0, PlacementRef::Task(task.id), "user1");
        assert!(matches!(
            boards.place(&second).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_cell_blocked_by_schema() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool.clone());

        let (board, task, _placement) = seed_board(&boards, &tasks).await;

        // A writer that skipped the occupancy check entirely (e.g. a
        // racing insert) still hits the unique index on the cell
        let result = sqlx::query(
            r#"
            INSERT INTO placements (id, owner_id, board_id, position, task_id, composite_id, completed, current_count, version, updated_at, deleted, deleted_at, last_synced_at)
            VALUES (?, 'user1', ?, 0, ?, NULL, 0, 0, 1, ?, 0, NULL, NULL)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(board.id.to_string())
        .bind(task.id.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await;

        let err = result.unwrap_err();
        assert!(err
            .as_database_error()
            .is_some_and(|d| d.is_unique_violation()));
    }

    #[tokio::test]
    async fn test_soft_deleted_placement_frees_cell() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool.clone());

        let (board, task, placement) = seed_board(&boards, &tasks).await;
        sqlx::query("UPDATE placements SET deleted = 1 WHERE id = ?")
            .bind(placement.id.to_string())
            .execute(&pool)
            .await
            .unwrap();

        let replacement = BoardPlacement::new(board.id, 0, PlacementRef::Task(task.id), "user1");
        let placed = boards.place(&replacement).await.unwrap();
        assert_eq!(placed.position, 0);
    }

    #[tokio::test]
    async fn test_increment_count_derives_completion() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let task = tasks
            .create(&Task::new("Run", "user1").with_kind(TaskKind::Quantified {
                action: "run".to_string(),
                unit: "km".to_string(),
                target_count: 3,
            }))
            .await
            .unwrap();
        let placement = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();

        let after_two = boards.increment_count(placement.id, 2).await.unwrap();
        assert_eq!(after_two.current_count, 2);
        assert!(!after_two.completed);

        let after_three = boards.increment_count(placement.id, 1).await.unwrap();
        assert_eq!(after_three.current_count, 3);
        assert!(after_three.completed);
    }

    #[tokio::test]
    async fn test_rapid_increments_coalesce_to_one_entry() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool.clone());
        let queue = OutboundQueue::new(pool);

        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let task = tasks
            .create(&Task::new("Pushups", "user1").with_kind(TaskKind::Quantified {
                action: "do".to_string(),
                unit: "reps".to_string(),
                target_count: 100,
            }))
            .await
            .unwrap();
        let placement = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();

        for _ in 0..10 {
            boards.increment_count(placement.id, 1).await.unwrap();
        }

        let entries = queue.entries_for(placement.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload["current_count"], 10);
    }

    #[tokio::test]
    async fn test_soft_delete_board_cascades_to_placements() {
        let (_tmp, pool) = test_pool().await;
        let boards = BoardStore::new(pool.clone());
        let tasks = TaskStore::new(pool);

        let (board, _task, placement) = seed_board(&boards, &tasks).await;
        boards.soft_delete_board(board.id).await.unwrap();

        let fetched = boards.get_board(board.id).await.unwrap().unwrap();
        assert!(fetched.deleted);
        assert!(boards.list_boards().await.unwrap().is_empty());

        let placement = boards.get_placement(placement.id).await.unwrap().unwrap();
        assert!(placement.deleted);
        assert!(boards
            .placements_for_board(board.id)
            .await
            .unwrap()
            .is_empty());
    }
}
