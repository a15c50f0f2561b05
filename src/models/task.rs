use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates how a task's completion is determined.
///
/// Multi-step tasks reference their steps by Task id (live lookup),
/// never by embedding the step data. Steps may not themselves be
/// multi-step; that is enforced at creation time by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Binary done/not-done.
    Simple,
    /// Completion derives from a per-placement counter reaching the target.
    Quantified {
        action: String,
        unit: String,
        target_count: i64,
    },
    /// Ordered list of step task ids.
    MultiStep { step_ids: Vec<Uuid> },
}

impl TaskKind {
    pub fn is_multi_step(&self) -> bool {
        matches!(self, TaskKind::MultiStep { .. })
    }
}

/// A reusable unit of work.
///
/// Tasks never record completion themselves; completion lives on the
/// board placement, so the same task can be done on one board and
/// open on another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub kind: TaskKind,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(title: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            title: title.into(),
            kind: TaskKind::Simple,
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Fields that count as user-visible content, for no-op write detection.
    pub(crate) fn content_eq(&self, other: &Task) -> bool {
        self.title == other.title && self.kind == other.kind && self.deleted == other.deleted
    }
}
