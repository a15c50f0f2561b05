use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node in a composite task's logic tree.
///
/// Closed union: operator nodes combine their children, leaf nodes
/// reference exactly one task or one other composite task. Evaluation
/// matches exhaustively, so a new operator is a compile-time-checked
/// change at every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    And,
    Or,
    Threshold { threshold: i64 },
    TaskRef { task_id: Uuid },
    CompositeRef { composite_id: Uuid },
}

impl NodeKind {
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            NodeKind::And | NodeKind::Or | NodeKind::Threshold { .. }
        )
    }

    pub fn is_leaf(&self) -> bool {
        !self.is_operator()
    }
}

/// A named logical combination over tasks and other composite tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeTask {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub root_node_id: Uuid,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CompositeTask {
    pub fn new(
        name: impl Into<String>,
        root_node_id: Uuid,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            root_node_id,
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }

    pub(crate) fn content_eq(&self, other: &CompositeTask) -> bool {
        self.name == other.name
            && self.root_node_id == other.root_node_id
            && self.deleted == other.deleted
    }
}

/// One row of a composite task's tree, stored flat and traversed by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeNode {
    pub id: Uuid,
    pub owner_id: String,
    pub composite_id: Uuid,
    /// None for the root node.
    pub parent_id: Option<Uuid>,
    /// Sibling ordering under the parent; evaluation sorts by this,
    /// not by insertion order.
    pub order_index: i64,
    pub kind: NodeKind,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl CompositeNode {
    pub fn new(
        composite_id: Uuid,
        parent_id: Option<Uuid>,
        order_index: i64,
        kind: NodeKind,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            composite_id,
            parent_id,
            order_index,
            kind,
            version: 1,
            updated_at: Utc::now(),
            deleted: false,
            deleted_at: None,
            last_synced_at: None,
        }
    }

    pub(crate) fn content_eq(&self, other: &CompositeNode) -> bool {
        self.parent_id == other.parent_id
            && self.order_index == other.order_index
            && self.kind == other.kind
            && self.deleted == other.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_kind_classification() {
        assert!(NodeKind::And.is_operator());
        assert!(NodeKind::Threshold { threshold: 2 }.is_operator());
        assert!(NodeKind::TaskRef {
            task_id: Uuid::new_v4()
        }
        .is_leaf());
        assert!(NodeKind::CompositeRef {
            composite_id: Uuid::new_v4()
        }
        .is_leaf());
    }

    #[test]
    fn test_node_kind_json_shape() {
        let kind = NodeKind::Threshold { threshold: 2 };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"type\":\"threshold\""));
        let parsed: NodeKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, kind);
    }

    #[test]
    fn test_composite_new() {
        let root = Uuid::new_v4();
        let composite = CompositeTask::new("Weekend warrior", root, "user1");
        assert_eq!(composite.root_node_id, root);
        assert_eq!(composite.version, 1);
    }
}
