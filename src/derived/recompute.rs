use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::{detect_lines, evaluate_composite};
use crate::db::{BoardStore, CompositeStore, StoreError};
use crate::models::{CompositeNode, NodeKind};

/// Rebuilds derived completion state from authoritative placement
/// rows, writing deltas through the normal store write path so they
/// are versioned and queued like any other local edit. Re-running with
/// unchanged inputs writes nothing.
pub struct Recomputer {
    pool: SqlitePool,
    boards: BoardStore,
    composites: CompositeStore,
}

/// Depth-first completion over the composite reference DAG. Each
/// composite is evaluated once against its own tree; references to
/// other composites use the already-resolved value, never an inline
/// expansion. The visiting set turns any cycle that bypassed
/// validation into "incomplete" instead of a hang.
fn resolve_completion(
    id: Uuid,
    trees: &HashMap<Uuid, (Uuid, HashMap<Uuid, CompositeNode>)>,
    task_done: &HashMap<Uuid, bool>,
    done: &mut HashMap<Uuid, bool>,
    visiting: &mut HashSet<Uuid>,
) -> bool {
    if let Some(value) = done.get(&id) {
        return *value;
    }
    if !visiting.insert(id) {
        return false;
    }

    let value = match trees.get(&id) {
        None => false,
        Some((root_id, nodes)) => {
            let mut composite_done = HashMap::new();
            for node in nodes.values() {
                if let NodeKind::CompositeRef { composite_id } = node.kind {
                    let resolved =
                        resolve_completion(composite_id, trees, task_done, done, visiting);
                    composite_done.insert(composite_id, resolved);
                }
            }
            evaluate_composite(nodes, *root_id, task_done, &composite_done)
        }
    };

    visiting.remove(&id);
    done.insert(id, value);
    value
}

impl Recomputer {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            boards: BoardStore::new(pool.clone()),
            composites: CompositeStore::new(pool.clone()),
            pool,
        }
    }

    /// A task counts as complete if any active placement of it is
    /// complete, aggregated across boards.
    pub async fn task_completion_map(&self) -> Result<HashMap<Uuid, bool>, StoreError> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT task_id, MAX(completed) FROM placements WHERE deleted = 0 AND task_id IS NOT NULL GROUP BY task_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::new();
        for (task_id, completed) in rows {
            map.insert(crate::db::parse_id(&task_id)?, completed);
        }
        Ok(map)
    }

    /// Rebuilds one board's cached line state from its placements.
    /// Returns whether the cache changed.
    pub async fn refresh_board(&self, board_id: Uuid) -> Result<bool, StoreError> {
        let Some(board) = self.boards.get_board(board_id).await? else {
            return Ok(false);
        };
        if board.deleted {
            return Ok(false);
        }

        let mut cells = vec![false; board.size.cell_count()];
        for placement in self.boards.placements_for_board(board_id).await? {
            let position = placement.position;
            if (0..cells.len() as i64).contains(&position) {
                cells[position as usize] = placement.completed;
            }
        }

        let report = detect_lines(&cells, board.size);
        self.boards
            .update_board_cache(board_id, report.line_count(), report.full_board)
            .await
    }

    /// Re-evaluates every composite task and pushes the result into
    /// the placements that reference it. Returns the boards whose
    /// cells changed and therefore need a line refresh.
    pub async fn refresh_composites(&self) -> Result<Vec<Uuid>, StoreError> {
        let task_done = self.task_completion_map().await?;
        let composites = self.composites.list().await?;

        let mut trees = HashMap::new();
        for composite in &composites {
            let nodes: HashMap<Uuid, CompositeNode> = self
                .composites
                .nodes_for(composite.id)
                .await?
                .into_iter()
                .map(|n| (n.id, n))
                .collect();
            trees.insert(composite.id, (composite.root_node_id, nodes));
        }

        let mut done = HashMap::new();
        let mut visiting = HashSet::new();
        for composite in &composites {
            resolve_completion(composite.id, &trees, &task_done, &mut done, &mut visiting);
        }

        let mut changed_boards = Vec::new();
        for composite in &composites {
            let value = done.get(&composite.id).copied().unwrap_or(false);
            for placement in self.boards.placements_for_composite(composite.id).await? {
                if placement.completed != value {
                    self.boards.set_completed(placement.id, value).await?;
                    if !changed_boards.contains(&placement.board_id) {
                        changed_boards.push(placement.board_id);
                    }
                }
            }
        }

        Ok(changed_boards)
    }

    /// Full recompute pass: composites first (their results land on
    /// board cells), then line caches for the given boards plus any
    /// board a composite touched.
    pub async fn refresh_all(&self, touched_boards: &[Uuid]) -> Result<usize, StoreError> {
        let mut boards: Vec<Uuid> = touched_boards.to_vec();
        for board_id in self.refresh_composites().await? {
            if !boards.contains(&board_id) {
                boards.push(board_id);
            }
        }

        let mut refreshed = 0;
        for board_id in boards {
            if self.refresh_board(board_id).await? {
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_pool, TaskStore};
    use crate::models::{Board, BoardPlacement, BoardSize, CompositeTask, PlacementRef, Task};

    async fn stores(pool: &SqlitePool) -> (TaskStore, BoardStore, CompositeStore, Recomputer) {
        (
            TaskStore::new(pool.clone()),
            BoardStore::new(pool.clone()),
            CompositeStore::new(pool.clone()),
            Recomputer::new(pool.clone()),
        )
    }

    #[tokio::test]
    async fn test_refresh_board_updates_line_cache() {
        let (_tmp, pool) = test_pool().await;
        let (tasks, boards, _composites, recomputer) = stores(&pool).await;

        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        for position in 0..3 {
            let task = tasks
                .create(&Task::new(format!("t{}", position), "user1"))
                .await
                .unwrap();
            let placement = boards
                .place(&BoardPlacement::new(
                    board.id,
                    position,
                    PlacementRef::Task(task.id),
                    "user1",
                ))
                .await
                .unwrap();
            boards.set_completed(placement.id, true).await.unwrap();
        }

        assert!(recomputer.refresh_board(board.id).await.unwrap());
        let board = boards.get_board(board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_line_count, 1);
        assert!(!board.full_board);
    }

    #[tokio::test]
    async fn test_refresh_board_is_idempotent() {
        let (_tmp, pool) = test_pool().await;
        let (tasks, boards, _composites, recomputer) = stores(&pool).await;

        let board = boards
            .create_board(&Board::new("Habits", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let task = tasks.create(&Task::new("t", "user1")).await.unwrap();
        let placement = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();
        boards.set_completed(placement.id, true).await.unwrap();

        recomputer.refresh_board(board.id).await.unwrap();
        let version_after_first = boards.get_board(board.id).await.unwrap().unwrap().version;

        // Second run sees no delta and bumps nothing
        assert!(!recomputer.refresh_board(board.id).await.unwrap());
        let version_after_second = boards.get_board(board.id).await.unwrap().unwrap().version;
        assert_eq!(version_after_first, version_after_second);
    }

    #[tokio::test]
    async fn test_refresh_composites_completes_placement() {
        let (_tmp, pool) = test_pool().await;
        let (tasks, boards, composites, recomputer) = stores(&pool).await;

        let task_a = tasks.create(&Task::new("a", "user1")).await.unwrap();
        let task_b = tasks.create(&Task::new("b", "user1")).await.unwrap();

        let composite_id = Uuid::new_v4();
        let root = CompositeNode::new(composite_id, None, 0, NodeKind::And, "user1");
        let leaves = vec![
            CompositeNode::new(
                composite_id,
                Some(root.id),
                0,
                NodeKind::TaskRef { task_id: task_a.id },
                "user1",
            ),
            CompositeNode::new(
                composite_id,
                Some(root.id),
                1,
                NodeKind::TaskRef { task_id: task_b.id },
                "user1",
            ),
        ];
        let mut composite = CompositeTask::new("Both", root.id, "user1");
        composite.id = composite_id;
        let mut nodes = vec![root];
        nodes.extend(leaves);
        composites.create(&composite, &nodes).await.unwrap();

        // Board 1 holds the plain tasks, board 2 holds the composite
        let board_1 = boards
            .create_board(&Board::new("One", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let board_2 = boards
            .create_board(&Board::new("Two", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let on_a = boards
            .place(&BoardPlacement::new(
                board_1.id,
                0,
                PlacementRef::Task(task_a.id),
                "user1",
            ))
            .await
            .unwrap();
        let on_b = boards
            .place(&BoardPlacement::new(
                board_1.id,
                1,
                PlacementRef::Task(task_b.id),
                "user1",
            ))
            .await
            .unwrap();
        let on_composite = boards
            .place(&BoardPlacement::new(
                board_2.id,
                0,
                PlacementRef::Composite(composite_id),
                "user1",
            ))
            .await
            .unwrap();

        // One of two done: composite stays incomplete
        boards.set_completed(on_a.id, true).await.unwrap();
        assert!(recomputer.refresh_composites().await.unwrap().is_empty());
        assert!(
            !boards
                .get_placement(on_composite.id)
                .await
                .unwrap()
                .unwrap()
                .completed
        );

        // Both done: composite placement flips and its board is reported
        boards.set_completed(on_b.id, true).await.unwrap();
        let changed = recomputer.refresh_composites().await.unwrap();
        assert_eq!(changed, vec![board_2.id]);
        assert!(
            boards
                .get_placement(on_composite.id)
                .await
                .unwrap()
                .unwrap()
                .completed
        );
    }

    #[tokio::test]
    async fn test_composite_of_composite_resolves_bottom_up() {
        let (_tmp, pool) = test_pool().await;
        let (tasks, boards, composites, recomputer) = stores(&pool).await;

        let task = tasks.create(&Task::new("t", "user1")).await.unwrap();

        // inner = OR(task), outer = AND(inner)
        let inner_id = Uuid::new_v4();
        let inner_root = CompositeNode::new(inner_id, None, 0, NodeKind::Or, "user1");
        let inner_leaf = CompositeNode::new(
            inner_id,
            Some(inner_root.id),
            0,
            NodeKind::TaskRef { task_id: task.id },
            "user1",
        );
        let mut inner = CompositeTask::new("Inner", inner_root.id, "user1");
        inner.id = inner_id;
        composites
            .create(&inner, &[inner_root, inner_leaf])
            .await
            .unwrap();

        let outer_id = Uuid::new_v4();
        let outer_root = CompositeNode::new(outer_id, None, 0, NodeKind::And, "user1");
        let outer_leaf = CompositeNode::new(
            outer_id,
            Some(outer_root.id),
            0,
            NodeKind::CompositeRef {
                composite_id: inner_id,
            },
            "user1",
        );
        let mut outer = CompositeTask::new("Outer", outer_root.id, "user1");
        outer.id = outer_id;
        composites
            .create(&outer, &[outer_root, outer_leaf])
            .await
            .unwrap();

        let board = boards
            .create_board(&Board::new("B", BoardSize::Three, "user1"))
            .await
            .unwrap();
        let on_task = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();
        let on_outer = boards
            .place(&BoardPlacement::new(
                board.id,
                1,
                PlacementRef::Composite(outer_id),
                "user1",
            ))
            .await
            .unwrap();

        boards.set_completed(on_task.id, true).await.unwrap();
        recomputer.refresh_composites().await.unwrap();

        assert!(
            boards
                .get_placement(on_outer.id)
                .await
                .unwrap()
                .unwrap()
                .completed
        );
    }

    #[tokio::test]
    async fn test_refresh_all_chains_composites_into_lines() {
        let (_tmp, pool) = test_pool().await;
        let (tasks, boards, composites, recomputer) = stores(&pool).await;

        let task = tasks.create(&Task::new("t", "user1")).await.unwrap();
        let composite_id = Uuid::new_v4();
        let root = CompositeNode::new(composite_id, None, 0, NodeKind::Or, "user1");
        let leaf = CompositeNode::new(
            composite_id,
            Some(root.id),
            0,
            NodeKind::TaskRef { task_id: task.id },
            "user1",
        );
        let mut composite = CompositeTask::new("C", root.id, "user1");
        composite.id = composite_id;
        composites.create(&composite, &[root, leaf]).await.unwrap();

        let board = boards
            .create_board(&Board::new("B", BoardSize::Three, "user1"))
            .await
            .unwrap();
        // Row 0: task, composite, task again via second placement
        let p0 = boards
            .place(&BoardPlacement::new(
                board.id,
                0,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();
        boards
            .place(&BoardPlacement::new(
                board.id,
                1,
                PlacementRef::Composite(composite_id),
                "user1",
            ))
            .await
            .unwrap();
        let p2 = boards
            .place(&BoardPlacement::new(
                board.id,
                2,
                PlacementRef::Task(task.id),
                "user1",
            ))
            .await
            .unwrap();

        boards.set_completed(p0.id, true).await.unwrap();
        boards.set_completed(p2.id, true).await.unwrap();

        let refreshed = recomputer.refresh_all(&[board.id]).await.unwrap();
        assert_eq!(refreshed, 1);
        let board = boards.get_board(board.id).await.unwrap().unwrap();
        assert_eq!(board.completed_line_count, 1);
    }
}
