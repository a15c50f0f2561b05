use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("Unknown queue operation '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    Done,
    DeadLettered,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InFlight => "in_flight",
            QueueStatus::Done => "done",
            QueueStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "in_flight" => Ok(QueueStatus::InFlight),
            "done" => Ok(QueueStatus::Done),
            "dead_lettered" => Ok(QueueStatus::DeadLettered),
            other => Err(format!("Unknown queue status '{}'", other)),
        }
    }
}

/// Input shape for `enqueue`. Everything else (seq, retry bookkeeping,
/// status) is assigned by the queue.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: serde_json::Value,
    /// Parent entity ids whose create entries must drain first.
    pub depends_on: Vec<Uuid>,
}

/// One durable pending mutation awaiting delivery to the remote store.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub seq: i64,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: serde_json::Value,
    pub depends_on: Vec<Uuid>,
    pub retry_count: i64,
    pub next_eligible_at: DateTime<Utc>,
    pub status: QueueStatus,
    pub enqueued_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// Version claimed by the payload snapshot, for the push envelope.
    pub fn payload_version(&self) -> i64 {
        self.payload
            .get("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::InFlight,
            QueueStatus::Done,
            QueueStatus::DeadLettered,
        ] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_operation_round_trip() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_payload_version() {
        let entry = QueueEntry {
            seq: 1,
            entity_id: Uuid::new_v4(),
            entity_type: EntityType::Task,
            operation: Operation::Update,
            payload: serde_json::json!({"version": 3}),
            depends_on: Vec::new(),
            retry_count: 0,
            next_eligible_at: Utc::now(),
            status: QueueStatus::Pending,
            enqueued_at: Utc::now(),
            last_error: None,
        };
        assert_eq!(entry.payload_version(), 3);
    }
}
