//! Per-entity-type conflict resolution.
//!
//! Resolution is a pure function over two snapshots of the same
//! entity. It is commutative, idempotent, and never bumps a version on
//! its own; applying a winner is the engine's job. Derived fields that
//! ride along in a winning payload (board line caches, composite
//! placement completion) are rebuilt by the recomputers afterwards and
//! never trusted as synced.

use crate::models::{EntitySnapshot, EntityType};

/// Picks the winner between a local and a remote copy of one entity.
///
/// Policy by entity type: last-writer-wins everywhere in v1. Shared
/// quantified counters would ideally merge additively; that is
/// deferred and approximated by last-writer-wins until data loss shows
/// up in practice.
pub fn resolve<'a>(a: &'a EntitySnapshot, b: &'a EntitySnapshot) -> &'a EntitySnapshot {
    match a.entity_type {
        EntityType::Task
        | EntityType::Board
        | EntityType::CompositeTask
        | EntityType::CompositeNode => last_writer_wins(a, b),
        EntityType::Placement => {
            if a.payload.get("current_count") != b.payload.get("current_count") {
                tracing::debug!(
                    entity_id = %a.id,
                    "diverged placement counters resolved by last-writer-wins"
                );
            }
            last_writer_wins(a, b)
        }
    }
}

/// Higher version wins; ties break on timestamp, then on the
/// lexicographically larger id, then on payload text so the order is
/// total and both call orders agree.
fn last_writer_wins<'a>(a: &'a EntitySnapshot, b: &'a EntitySnapshot) -> &'a EntitySnapshot {
    if !a.has_orderable_version() || !b.has_orderable_version() {
        tracing::warn!(
            entity_id = %a.id,
            local_version = a.version,
            remote_version = b.version,
            "snapshot with unorderable version; treating it as losing"
        );
    }

    let key = |snap: &EntitySnapshot| {
        let version = if snap.has_orderable_version() {
            snap.version
        } else {
            i64::MIN
        };
        (version, snap.updated_at, snap.id.to_string())
    };

    match key(a).cmp(&key(b)) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            let text_a = a.payload.to_string();
            let text_b = b.payload.to_string();
            if text_a >= text_b {
                a
            } else {
                b
            }
        }
    }
}
