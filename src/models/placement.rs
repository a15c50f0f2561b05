use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a board cell points at: a plain task or a composite task.
/// Exactly one, by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementRef {
    Task(Uuid),
    Composite(Uuid),
}

/// Junction row linking a task (or composite task) to one board cell.
///
/// This is the only place completion is recorded. The same task placed
/// on two boards has two placements with independent completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardPlacement {
    pub id: Uuid,
    pub owner_id: String,
    pub board_id: Uuid,
    /// Row-major cell index.
    pub position: i64,
    pub target: PlacementRef,
    pub completed: bool,
    /// Progress counter for quantified tasks; unused otherwise.
    pub current_count: i64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl BoardPlacement {
    pub fn new(
        board_id: Uuid,
        position: i64,
        target: PlacementRef,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            board_id,
            position,
            target,
            completed: false,
            current_count: 0,
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }

    pub fn task_id(&self) -> Option<Uuid> {
        match self.target {
            PlacementRef::Task(id) => Some(id),
            PlacementRef::Composite(_) => None,
        }
    }

    pub fn composite_id(&self) -> Option<Uuid> {
        match self.target {
            PlacementRef::Task(_) => None,
            PlacementRef::Composite(id) => Some(id),
        }
    }

    pub(crate) fn content_eq(&self, other: &BoardPlacement) -> bool {
        self.board_id == other.board_id
            && self.position == other.position
            && self.target == other.target
            && self.completed == other.completed
            && self.current_count == other.current_count
            && self.deleted == other.deleted
    }
}
