use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{CompositeNode, NodeKind};

/// Evaluates one composite task's logic tree to a completion boolean.
///
/// `nodes` is the arena of that composite's nodes keyed by id;
/// traversal follows ids rather than references. `task_done` maps task
/// ids to their completion, `composite_done` maps referenced composite
/// task ids to completion evaluated separately by their own call into
/// this function. A referenced composite is never inline-expanded
/// here, so evaluation cannot loop even if a cycle slipped past
/// validation. Missing lookups resolve to incomplete, not errors.
pub fn evaluate_composite(
    nodes: &HashMap<Uuid, CompositeNode>,
    root_id: Uuid,
    task_done: &HashMap<Uuid, bool>,
    composite_done: &HashMap<Uuid, bool>,
) -> bool {
    // Child index, siblings in explicit order
    let mut children: HashMap<Uuid, Vec<&CompositeNode>> = HashMap::new();
    for node in nodes.values() {
        if let Some(parent_id) = node.parent_id {
            children.entry(parent_id).or_default().push(node);
        }
    }
    for siblings in children.values_mut() {
        siblings.sort_by_key(|n| n.order_index);
    }

    eval_node(nodes, &children, root_id, task_done, composite_done)
}

fn eval_node(
    nodes: &HashMap<Uuid, CompositeNode>,
    children: &HashMap<Uuid, Vec<&CompositeNode>>,
    node_id: Uuid,
    task_done: &HashMap<Uuid, bool>,
    composite_done: &HashMap<Uuid, bool>,
) -> bool {
    let Some(node) = nodes.get(&node_id) else {
        return false;
    };

    match &node.kind {
        NodeKind::TaskRef { task_id } => task_done.get(task_id).copied().unwrap_or(false),
        NodeKind::CompositeRef { composite_id } => {
            composite_done.get(composite_id).copied().unwrap_or(false)
        }
        NodeKind::And | NodeKind::Or | NodeKind::Threshold { .. } => {
            let kids = children.get(&node_id).map(Vec::as_slice).unwrap_or(&[]);
            let mut done = 0usize;
            for kid in kids {
                if eval_node(nodes, children, kid.id, task_done, composite_done) {
                    done += 1;
                }
            }
            match node.kind {
                // AND is vacuously true with no children; OR is not
                NodeKind::And => done == kids.len(),
                NodeKind::Or => done > 0,
                NodeKind::Threshold { threshold } => done as i64 >= threshold,
                NodeKind::TaskRef { .. } | NodeKind::CompositeRef { .. } => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TreeBuilder {
        composite_id: Uuid,
        nodes: HashMap<Uuid, CompositeNode>,
    }

    impl TreeBuilder {
        fn new() -> Self {
            Self {
                composite_id: Uuid::new_v4(),
                nodes: HashMap::new(),
            }
        }

        fn add(&mut self, parent: Option<Uuid>, order: i64, kind: NodeKind) -> Uuid {
            let node = CompositeNode::new(self.composite_id, parent, order, kind, "user1");
            let id = node.id;
            self.nodes.insert(id, node);
            id
        }
    }

    fn done_map(pairs: &[(Uuid, bool)]) -> HashMap<Uuid, bool> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_and_with_zero_children_is_true() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::And);
        assert!(evaluate_composite(
            &tree.nodes,
            root,
            &HashMap::new(),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_or_with_zero_children_is_false() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::Or);
        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &HashMap::new(),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_and_requires_all() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::And);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        tree.add(Some(root), 0, NodeKind::TaskRef { task_id: a });
        tree.add(Some(root), 1, NodeKind::TaskRef { task_id: b });

        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &done_map(&[(a, true), (b, false)]),
            &HashMap::new()
        ));
        assert!(evaluate_composite(
            &tree.nodes,
            root,
            &done_map(&[(a, true), (b, true)]),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_threshold_two_of_three() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::Threshold { threshold: 2 });
        let tasks: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, task_id) in tasks.iter().enumerate() {
            tree.add(Some(root), i as i64, NodeKind::TaskRef { task_id: *task_id });
        }

        let one_done = done_map(&[(tasks[0], true)]);
        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &one_done,
            &HashMap::new()
        ));

        let two_done = done_map(&[(tasks[0], true), (tasks[2], true)]);
        assert!(evaluate_composite(
            &tree.nodes,
            root,
            &two_done,
            &HashMap::new()
        ));
    }

    #[test]
    fn test_missing_task_counts_as_incomplete() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::Or);
        tree.add(
            Some(root),
            0,
            NodeKind::TaskRef {
                task_id: Uuid::new_v4(),
            },
        );
        // Dangling reference is "not complete", never a crash
        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &HashMap::new(),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_composite_leaf_uses_supplied_map() {
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::And);
        let child_composite = Uuid::new_v4();
        tree.add(
            Some(root),
            0,
            NodeKind::CompositeRef {
                composite_id: child_composite,
            },
        );

        assert!(evaluate_composite(
            &tree.nodes,
            root,
            &HashMap::new(),
            &done_map(&[(child_composite, true)])
        ));
        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &HashMap::new(),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_nested_operators() {
        // AND(OR(a, b), threshold-1-of-(c))
        let mut tree = TreeBuilder::new();
        let root = tree.add(None, 0, NodeKind::And);
        let or = tree.add(Some(root), 0, NodeKind::Or);
        let th = tree.add(Some(root), 1, NodeKind::Threshold { threshold: 1 });
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        tree.add(Some(or), 0, NodeKind::TaskRef { task_id: a });
        tree.add(Some(or), 1, NodeKind::TaskRef { task_id: b });
        tree.add(Some(th), 0, NodeKind::TaskRef { task_id: c });

        assert!(evaluate_composite(
            &tree.nodes,
            root,
            &done_map(&[(b, true), (c, true)]),
            &HashMap::new()
        ));
        assert!(!evaluate_composite(
            &tree.nodes,
            root,
            &done_map(&[(a, true), (b, true)]),
            &HashMap::new()
        ));
    }

    #[test]
    fn test_missing_root_is_false() {
        let tree = TreeBuilder::new();
        assert!(!evaluate_composite(
            &tree.nodes,
            Uuid::new_v4(),
            &HashMap::new(),
            &HashMap::new()
        ));
    }
}
