use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Tag selecting the table and the conflict-resolution policy for a
/// synced entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Task,
    Board,
    Placement,
    CompositeTask,
    CompositeNode,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Task => "task",
            EntityType::Board => "board",
            EntityType::Placement => "placement",
            EntityType::CompositeTask => "composite_task",
            EntityType::CompositeNode => "composite_node",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(EntityType::Task),
            "board" => Ok(EntityType::Board),
            "placement" => Ok(EntityType::Placement),
            "composite_task" => Ok(EntityType::CompositeTask),
            "composite_node" => Ok(EntityType::CompositeNode),
            other => Err(format!("Unknown entity type '{}'", other)),
        }
    }
}

/// Wire shape for one entity: the envelope the conflict resolver
/// orders by, plus the full entity JSON as payload.
///
/// Both sides of a conflict and both directions of sync use this
/// shape, so resolution is a pure function over two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub owner_id: String,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub payload: serde_json::Value,
}

impl EntitySnapshot {
    /// Versions below 1 cannot be ordered meaningfully; the resolver
    /// treats such a snapshot as always-losing.
    pub fn has_orderable_version(&self) -> bool {
        self.version >= 1
    }
}
