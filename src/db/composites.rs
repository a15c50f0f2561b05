use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use uuid::Uuid;

use super::{parse_id, parse_opt_timestamp, parse_timestamp, queue, StoreError};
use crate::models::{CompositeNode, CompositeTask, EntityType, NewQueueEntry, NodeKind, Operation};

pub struct CompositeStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct CompositeRow {
    id: String,
    owner_id: String,
    name: String,
    root_node_id: String,
    version: i64,
    updated_at: String,
    deleted: bool,
    deleted_at: Option<String>,
    last_synced_at: Option<String>,
}

impl CompositeRow {
    fn hydrate(self) -> Result<CompositeTask, StoreError> {
        Ok(CompositeTask {
            id: parse_id(&self.id)?,
            owner_id: self.owner_id,
            name: self.name,
            root_node_id: parse_id(&self.root_node_id)?,
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
            deleted_at: parse_opt_timestamp(&self.deleted_at)?,
            last_synced_at: parse_opt_timestamp(&self.last_synced_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NodeRow {
    id: String,
    owner_id: String,
    composite_id: String,
    parent_id: Option<String>,
    order_index: i64,
    kind: String,
    version: i64,
    updated_at: String,
    deleted: bool,
    deleted_at: Option<String>,
    last_synced_at: Option<String>,
}

impl NodeRow {
    fn hydrate(self) -> Result<CompositeNode, StoreError> {
        Ok(CompositeNode {
            id: parse_id(&self.id)?,
            owner_id: self.owner_id,
            composite_id: parse_id(&self.composite_id)?,
            parent_id: self.parent_id.as_deref().map(parse_id).transpose()?,
            order_index: self.order_index,
            kind: serde_json::from_str(&self.kind)?,
            version: self.version,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted: self.deleted,
            deleted_at: parse_opt_timestamp(&self.deleted_at)?,
            last_synced_at: parse_opt_timestamp(&self.last_synced_at)?,
        })
    }
}

fn composite_queue_entry(
    composite: &CompositeTask,
    op: Operation,
) -> Result<NewQueueEntry, StoreError> {
    Ok(NewQueueEntry {
        entity_id: composite.id,
        entity_type: EntityType::CompositeTask,
        operation: op,
        payload: serde_json::to_value(composite)?,
        depends_on: Vec::new(),
    })
}

fn node_queue_entry(node: &CompositeNode, op: Operation) -> Result<NewQueueEntry, StoreError> {
    let mut depends_on = vec![node.composite_id];
    match node.kind {
        NodeKind::TaskRef { task_id } => depends_on.push(task_id),
        NodeKind::CompositeRef { composite_id } => depends_on.push(composite_id),
        NodeKind::And | NodeKind::Or | NodeKind::Threshold { .. } => {}
    }
    Ok(NewQueueEntry {
        entity_id: node.id,
        entity_type: EntityType::CompositeNode,
        operation: op,
        payload: serde_json::to_value(node)?,
        depends_on,
    })
}

/// Rewrites a node's kind inside the caller's transaction, bumping the
/// version and queueing the update. An unchanged kind writes nothing.
async fn write_node_kind_tx(
    conn: &mut SqliteConnection,
    node: &CompositeNode,
    kind: NodeKind,
) -> Result<(), StoreError> {
    let mut updated = node.clone();
    updated.kind = kind;
    if node.content_eq(&updated) {
        return Ok(());
    }
    updated.version += 1;
    updated.updated_at = Utc::now();

    sqlx::query("UPDATE composite_nodes SET kind = ?, version = ?, updated_at = ? WHERE id = ?")
        .bind(serde_json::to_string(&updated.kind)?)
        .bind(updated.version)
        .bind(updated.updated_at.to_rfc3339())
        .bind(updated.id.to_string())
        .execute(&mut *conn)
        .await?;
    queue::enqueue(conn, &node_queue_entry(&updated, Operation::Update)?).await?;
    Ok(())
}

/// Clamps every threshold operator into `[1, child_count]`, using the
/// given node set as the tree.
fn clamp_thresholds(nodes: &mut [CompositeNode]) {
    let counts: Vec<(Uuid, i64)> = nodes
        .iter()
        .filter(|n| n.kind.is_operator())
        .map(|op| {
            let count = nodes
                .iter()
                .filter(|n| n.parent_id == Some(op.id))
                .count() as i64;
            (op.id, count)
        })
        .collect();

    for (op_id, child_count) in counts {
        if let Some(node) = nodes.iter_mut().find(|n| n.id == op_id) {
            if let NodeKind::Threshold { threshold } = &mut node.kind {
                *threshold = (*threshold).clamp(1, child_count.max(1));
            }
        }
    }
}

impl CompositeStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a composite task and its whole node tree atomically.
    ///
    /// Rejects trees whose shape is invalid and trees that would make
    /// the composite reference itself through any chain of
    /// composite-ref leaves. Dangling references to not-yet-created
    /// composites are allowed; they just evaluate to incomplete.
    pub async fn create(
        &self,
        composite: &CompositeTask,
        nodes: &[CompositeNode],
    ) -> Result<CompositeTask, StoreError> {
        let mut nodes = nodes.to_vec();
        self.validate_tree(composite, &nodes).await?;
        clamp_thresholds(&mut nodes);

        let mut composite = composite.clone();
        composite.version = 1;
        composite.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query(
            r#"
            INSERT INTO composite_tasks (id, owner_id, name, root_node_id, version, updated_at, deleted, deleted_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(composite.id.to_string())
        .bind(&composite.owner_id)
        .bind(&composite.name)
        .bind(composite.root_node_id.to_string())
        .bind(composite.version)
        .bind(composite.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                return Err(StoreError::Validation(format!(
                    "composite task {} already exists",
                    composite.id
                )));
            }
            return Err(e.into());
        }

        queue::enqueue(
            &mut tx,
            &composite_queue_entry(&composite, Operation::Create)?,
        )
        .await?;

        for node in &mut nodes {
            node.version = 1;
            node.updated_at = composite.updated_at;
            sqlx::query(
                r#"
                INSERT INTO composite_nodes (id, owner_id, composite_id, parent_id, order_index, kind, version, updated_at, deleted, deleted_at, last_synced_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL)
                "#,
            )
            .bind(node.id.to_string())
            .bind(&node.owner_id)
            .bind(node.composite_id.to_string())
            .bind(node.parent_id.map(|id| id.to_string()))
            .bind(node.order_index)
            .bind(serde_json::to_string(&node.kind)?)
            .bind(node.version)
            .bind(node.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;

            queue::enqueue(&mut tx, &node_queue_entry(node, Operation::Create)?).await?;
        }

        tx.commit().await?;
        Ok(composite)
    }

    async fn validate_tree(
        &self,
        composite: &CompositeTask,
        nodes: &[CompositeNode],
    ) -> Result<(), StoreError> {
        if nodes.is_empty() {
            return Err(StoreError::Validation(
                "composite task needs at least a root node".to_string(),
            ));
        }

        let ids: HashSet<Uuid> = nodes.iter().map(|n| n.id).collect();
        let root = nodes
            .iter()
            .find(|n| n.id == composite.root_node_id)
            .ok_or_else(|| {
                StoreError::Validation("root_node_id not present in node set".to_string())
            })?;
        if root.parent_id.is_some() {
            return Err(StoreError::Validation(
                "root node must not have a parent".to_string(),
            ));
        }

        let mut referenced = HashSet::new();
        for node in nodes {
            if node.composite_id != composite.id {
                return Err(StoreError::Validation(format!(
                    "node {} belongs to a different composite",
                    node.id
                )));
            }
            if node.id != root.id {
                let parent_id = node.parent_id.ok_or_else(|| {
                    StoreError::Validation(format!("node {} has no parent", node.id))
                })?;
                if !ids.contains(&parent_id) {
                    return Err(StoreError::Validation(format!(
                        "node {} has parent outside the tree",
                        node.id
                    )));
                }
                let parent = nodes.iter().find(|n| n.id == parent_id);
                if !parent.is_some_and(|p| p.kind.is_operator()) {
                    return Err(StoreError::Validation(format!(
                        "node {} has a leaf as parent",
                        node.id
                    )));
                }
            }
            if let NodeKind::CompositeRef { composite_id } = node.kind {
                if composite_id == composite.id {
                    return Err(StoreError::Validation(
                        "composite task cannot reference itself".to_string(),
                    ));
                }
                referenced.insert(composite_id);
            }
        }

        // Walk every reachable composite; arriving back here is a cycle.
        let mut queue: Vec<Uuid> = referenced.into_iter().collect();
        let mut visited = HashSet::new();
        while let Some(next) = queue.pop() {
            if !visited.insert(next) {
                continue;
            }
            for node in self.nodes_for(next).await? {
                if let NodeKind::CompositeRef { composite_id } = node.kind {
                    if composite_id == composite.id {
                        return Err(StoreError::Validation(format!(
                            "cyclic composite reference through {}",
                            next
                        )));
                    }
                    queue.push(composite_id);
                }
            }
        }

        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CompositeTask>, StoreError> {
        let row: Option<CompositeRow> = sqlx::query_as("SELECT * FROM composite_tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(CompositeRow::hydrate).transpose()
    }

    pub async fn list(&self) -> Result<Vec<CompositeTask>, StoreError> {
        let rows: Vec<CompositeRow> =
            sqlx::query_as("SELECT * FROM composite_tasks WHERE deleted = 0 ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(CompositeRow::hydrate).collect()
    }

    pub async fn update(&self, composite: &CompositeTask) -> Result<CompositeTask, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<CompositeRow> = sqlx::query_as("SELECT * FROM composite_tasks WHERE id = ?")
            .bind(composite.id.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let stored = row
            .ok_or_else(|| StoreError::Validation(format!("unknown composite {}", composite.id)))?
            .hydrate()?;

        if stored.content_eq(composite) {
            tx.commit().await?;
            return Ok(stored);
        }

        let mut updated = composite.clone();
        updated.version = stored.version + 1;
        updated.updated_at = Utc::now();
        updated.last_synced_at = stored.last_synced_at;

        sqlx::query(
            "UPDATE composite_tasks SET name = ?, root_node_id = ?, version = ?, updated_at = ?, deleted = ?, deleted_at = ? WHERE id = ?",
        )
        .bind(&updated.name)
        .bind(updated.root_node_id.to_string())
        .bind(updated.version)
        .bind(updated.updated_at.to_rfc3339())
        .bind(updated.deleted)
        .bind(updated.deleted_at.map(|t| t.to_rfc3339()))
        .bind(updated.id.to_string())
        .execute(&mut *tx)
        .await?;

        queue::enqueue(
            &mut tx,
            &composite_queue_entry(&updated, Operation::Update)?,
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    pub async fn get_node(&self, id: Uuid) -> Result<Option<CompositeNode>, StoreError> {
        let row: Option<NodeRow> = sqlx::query_as("SELECT * FROM composite_nodes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(NodeRow::hydrate).transpose()
    }

    /// Active nodes of one composite's tree.
    pub async fn nodes_for(&self, composite_id: Uuid) -> Result<Vec<CompositeNode>, StoreError> {
        let rows: Vec<NodeRow> = sqlx::query_as(
            "SELECT * FROM composite_nodes WHERE composite_id = ? AND deleted = 0 ORDER BY order_index",
        )
        .bind(composite_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(NodeRow::hydrate).collect()
    }

    /// Soft-deletes a node and its whole subtree, then re-clamps the
    /// parent's threshold against the surviving child count.
    pub async fn remove_node(&self, node_id: Uuid) -> Result<(), StoreError> {
        let node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown node {}", node_id)))?;
        let Some(parent_id) = node.parent_id else {
            return Err(StoreError::Validation(
                "cannot remove the root node".to_string(),
            ));
        };

        let all = self.nodes_for(node.composite_id).await?;

        // Collect the subtree rooted at node_id
        let mut to_remove = vec![node.clone()];
        let mut frontier = vec![node_id];
        while let Some(parent) = frontier.pop() {
            for child in all.iter().filter(|n| n.parent_id == Some(parent)) {
                frontier.push(child.id);
                to_remove.push(child.clone());
            }
        }

        let now = Utc::now();
        let removed: HashSet<Uuid> = to_remove.iter().map(|n| n.id).collect();
        let mut tx = self.pool.begin().await?;
        for doomed in &mut to_remove {
            doomed.deleted = true;
            doomed.deleted_at = Some(now);
            doomed.version += 1;
            doomed.updated_at = now;
            sqlx::query(
                "UPDATE composite_nodes SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(doomed.version)
            .bind(now.to_rfc3339())
            .bind(doomed.id.to_string())
            .execute(&mut *tx)
            .await?;
            queue::enqueue(&mut tx, &node_queue_entry(doomed, Operation::Delete)?).await?;
        }

        // Threshold may now exceed the surviving child count; the
        // re-clamp rides the removal transaction
        if let Some(parent) = all.iter().find(|n| n.id == parent_id) {
            if let NodeKind::Threshold { threshold } = parent.kind {
                let survivors = all
                    .iter()
                    .filter(|n| n.parent_id == Some(parent_id) && !removed.contains(&n.id))
                    .count() as i64;
                let clamped = threshold.clamp(1, survivors.max(1));
                write_node_kind_tx(&mut tx, parent, NodeKind::Threshold { threshold: clamped })
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Sets a threshold operator's N, clamped into `[1, child_count]`.
    pub async fn set_threshold(&self, node_id: Uuid, threshold: i64) -> Result<(), StoreError> {
        let node = self
            .get_node(node_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown node {}", node_id)))?;
        let NodeKind::Threshold { .. } = node.kind else {
            return Err(StoreError::Validation(format!(
                "node {} is not a threshold operator",
                node_id
            )));
        };

        let children = self
            .nodes_for(node.composite_id)
            .await?
            .iter()
            .filter(|n| n.parent_id == Some(node_id))
            .count() as i64;
        let clamped = threshold.clamp(1, children.max(1));

        let mut tx = self.pool.begin().await?;
        write_node_kind_tx(&mut tx, &node, NodeKind::Threshold { threshold: clamped }).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn soft_delete(&self, composite_id: Uuid) -> Result<(), StoreError> {
        let stored = self
            .get(composite_id)
            .await?
            .ok_or_else(|| StoreError::Validation(format!("unknown composite {}", composite_id)))?;
        if stored.deleted {
            return Ok(());
        }

        let now = Utc::now();
        let mut composite = stored;
        composite.deleted = true;
        composite.deleted_at = Some(now);
        composite.version += 1;
        composite.updated_at = now;

        let nodes = self.nodes_for(composite_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE composite_tasks SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(composite.version)
        .bind(now.to_rfc3339())
        .bind(composite_id.to_string())
        .execute(&mut *tx)
        .await?;
        queue::enqueue(
            &mut tx,
            &composite_queue_entry(&composite, Operation::Delete)?,
        )
        .await?;

        for node in nodes {
            let mut node = node;
            node.deleted = true;
            node.deleted_at = Some(now);
            node.version += 1;
            node.updated_at = now;
            sqlx::query(
                "UPDATE composite_nodes SET deleted = 1, deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
            )
            .bind(now.to_rfc3339())
            .bind(node.version)
            .bind(now.to_rfc3339())
            .bind(node.id.to_string())
            .execute(&mut *tx)
            .await?;
            queue::enqueue(&mut tx, &node_queue_entry(&node, Operation::Delete)?).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
