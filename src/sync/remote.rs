use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::SyncError;
use crate::models::{EntitySnapshot, EntityType, Operation, QueueEntry};

/// One outbound mutation as the remote store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEntry {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub version: i64,
    pub payload: serde_json::Value,
}

impl PushEntry {
    pub fn from_queue_entry(entry: &QueueEntry) -> Self {
        Self {
            entity_id: entry.entity_id,
            entity_type: entry.entity_type,
            operation: entry.operation,
            version: entry.payload_version(),
            payload: entry.payload.clone(),
        }
    }
}

/// Per-entry push result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOutcome {
    pub entity_id: Uuid,
    pub accepted: bool,
    #[serde(default)]
    pub server_version: Option<i64>,
}

/// One page of remote changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullPage {
    pub entities: Vec<EntitySnapshot>,
    pub new_checkpoint: DateTime<Utc>,
}

/// The sync engine's view of the remote document store.
///
/// Retrying the same `(id, version)` pair is assumed idempotent on the
/// remote side, so at-least-once delivery is safe.
#[allow(async_fn_in_trait)]
pub trait RemoteStore {
    async fn push_batch(&self, batch: &[PushEntry]) -> Result<Vec<PushOutcome>, SyncError>;

    async fn pull_since(
        &self,
        checkpoint: DateTime<Utc>,
        owner_id: &str,
    ) -> Result<PullPage, SyncError>;
}
