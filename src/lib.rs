//! Task Bingo Core Library
//!
//! Local-first storage and sync for bingo-style task boards. All reads
//! and writes hit the local SQLite database; a background engine pushes
//! queued mutations to the sync server and pulls remote changes in,
//! resolving conflicts deterministically.

pub mod config;
pub mod db;
pub mod derived;
pub mod models;
pub mod sync;

pub use config::{Config, ConfigError, SyncConfig};
pub use db::{
    init_db, BoardStore, CheckpointStore, CompositeStore, OutboundQueue, SnapshotStore,
    StoreError, TaskStore,
};
pub use derived::{detect_lines, evaluate_composite, LineReport, Recomputer};
pub use models::{
    Board, BoardPlacement, BoardSize, CompositeNode, CompositeTask, EntitySnapshot, EntityType,
    NewQueueEntry, NodeKind, Operation, PlacementRef, QueueEntry, QueueStatus, Task, TaskKind,
};
pub use sync::{
    resolve, HttpRemoteStore, PullPage, PullReport, PushEntry, PushOutcome, PushReport,
    RemoteStore, SyncEngine, SyncError,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
