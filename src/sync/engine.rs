//! Push/pull cycle orchestration.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use super::{resolve, PushEntry, RemoteStore, SyncError};
use crate::config::Config;
use crate::db::{parse_id, CheckpointStore, OutboundQueue, SnapshotStore, StoreError};
use crate::derived::Recomputer;
use crate::models::{EntitySnapshot, EntityType};

const DEFAULT_PUSH_BATCH_SIZE: usize = 50;
const DEFAULT_PULL_INTERVAL_SECS: u64 = 300;

/// What one push cycle accomplished.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PushReport {
    /// Entries the remote accepted
    pub delivered: usize,
    /// Entries the remote rejected; now dead-lettered
    pub rejected: usize,
    /// Entries put back for a later retry
    pub deferred: usize,
}

/// What one pull cycle accomplished.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PullReport {
    /// Remote snapshots that won resolution and were written locally
    pub applied: usize,
    /// Remote snapshots discarded because the local copy won
    pub kept_local: usize,
    /// Remote snapshots that could not be decoded; logged and skipped
    pub skipped: usize,
    /// Boards whose cached line state changed during recompute
    pub boards_refreshed: usize,
}

enum SnapshotOutcome {
    Applied { touched_board: Option<Uuid> },
    KeptLocal,
}

#[derive(Clone, Copy, PartialEq)]
enum GateState {
    Idle,
    Running,
    RunningQueued,
}

/// Re-entrancy guard for sync cycles. A trigger that arrives while a
/// cycle is running is remembered and collapses into exactly one
/// follow-up cycle, no matter how many triggers pile up.
struct CycleGate {
    state: Mutex<GateState>,
}

impl CycleGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
        }
    }

    /// True when the caller may run a cycle now. False means a cycle is
    /// already running and a follow-up has been queued.
    fn try_enter(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            GateState::Idle => {
                *state = GateState::Running;
                true
            }
            GateState::Running => {
                *state = GateState::RunningQueued;
                false
            }
            GateState::RunningQueued => false,
        }
    }

    /// True when a follow-up was queued while running; the gate stays
    /// held and the caller should run another cycle.
    fn finish(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            GateState::RunningQueued => {
                *state = GateState::Running;
                true
            }
            _ => {
                *state = GateState::Idle;
                false
            }
        }
    }

    /// Releases the gate unconditionally, dropping any queued follow-up.
    fn reset(&self) {
        *self.state.lock().unwrap() = GateState::Idle;
    }
}

/// Drives synchronization against a remote store: drains the outbound
/// queue on push, fetches and resolves remote changes on pull, and
/// rebuilds derived state afterwards. Generic over the remote so tests
/// can substitute an in-memory one.
pub struct SyncEngine<R> {
    remote: R,
    owner_id: String,
    queue: OutboundQueue,
    snapshots: SnapshotStore,
    checkpoints: CheckpointStore,
    recomputer: Recomputer,
    gate: CycleGate,
    notify: Notify,
    push_batch_size: usize,
    pull_interval_secs: u64,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(pool: SqlitePool, remote: R, owner_id: impl Into<String>) -> Self {
        Self {
            queue: OutboundQueue::new(pool.clone()),
            snapshots: SnapshotStore::new(pool.clone()),
            checkpoints: CheckpointStore::new(pool.clone()),
            recomputer: Recomputer::new(pool),
            remote,
            owner_id: owner_id.into(),
            gate: CycleGate::new(),
            notify: Notify::new(),
            push_batch_size: DEFAULT_PUSH_BATCH_SIZE,
            pull_interval_secs: DEFAULT_PULL_INTERVAL_SECS,
        }
    }

    /// Wires the engine's knobs from config.
    pub fn from_config(pool: SqlitePool, remote: R, config: &Config) -> Self {
        let mut engine = Self::new(pool.clone(), remote, config.owner.clone());
        engine.queue = OutboundQueue::new(pool).with_max_retries(config.sync.max_retries);
        engine.push_batch_size = config.sync.push_batch_size;
        engine.pull_interval_secs = config.sync.pull_interval_secs;
        engine
    }

    pub fn with_push_batch_size(mut self, batch_size: usize) -> Self {
        self.push_batch_size = batch_size;
        self
    }

    pub fn with_pull_interval(mut self, secs: u64) -> Self {
        self.pull_interval_secs = secs;
        self
    }

    /// Requests a sync cycle soon, e.g. after a burst of local edits.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Drains the outbound queue to the remote in dependency-ordered
    /// batches until nothing eligible remains.
    ///
    /// Accepted entries are confirmed and their entities stamped as
    /// synced; rejected entries dead-letter; a transport failure puts
    /// the whole batch back with backoff and ends the cycle early.
    pub async fn push_cycle(&self) -> Result<PushReport, SyncError> {
        let mut report = PushReport::default();

        loop {
            let batch = self.queue.drain(self.push_batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let entries: Vec<PushEntry> = batch.iter().map(PushEntry::from_queue_entry).collect();
            match self.remote.push_batch(&entries).await {
                Ok(outcomes) => {
                    let by_entity: HashMap<Uuid, _> =
                        outcomes.into_iter().map(|o| (o.entity_id, o)).collect();
                    for entry in &batch {
                        match by_entity.get(&entry.entity_id) {
                            Some(outcome) if outcome.accepted => {
                                self.queue.mark_done(entry.seq).await?;
                                self.snapshots
                                    .stamp_synced(entry.entity_type, entry.entity_id)
                                    .await?;
                                report.delivered += 1;
                            }
                            Some(outcome) => {
                                tracing::warn!(
                                    entity_id = %entry.entity_id,
                                    server_version = ?outcome.server_version,
                                    "remote rejected entry, dead-lettering"
                                );
                                self.queue
                                    .mark_dead(entry.seq, "rejected by remote")
                                    .await?;
                                report.rejected += 1;
                            }
                            None => {
                                self.queue
                                    .mark_failed(entry.seq, "no outcome returned for entry")
                                    .await?;
                                report.deferred += 1;
                            }
                        }
                    }
                }
                Err(err @ SyncError::Transient(_)) => {
                    tracing::warn!(error = %err, batch = batch.len(), "push batch failed, will retry");
                    for entry in &batch {
                        self.queue.mark_failed(entry.seq, &err.to_string()).await?;
                        report.deferred += 1;
                    }
                    break;
                }
                Err(err) => {
                    for entry in &batch {
                        self.queue.mark_failed(entry.seq, &err.to_string()).await?;
                    }
                    return Err(err);
                }
            }
        }

        Ok(report)
    }

    /// Fetches remote changes since the checkpoint, resolves each
    /// against the local copy, and rebuilds derived state for anything
    /// that changed. The checkpoint only advances after everything in
    /// the page applied cleanly, so a failed pull replays the same page.
    ///
    /// A snapshot that cannot be decoded is logged and skipped rather
    /// than failing the cycle; otherwise one poison snapshot would pin
    /// the checkpoint and halt pull forever.
    pub async fn pull_cycle(&self) -> Result<PullReport, SyncError> {
        let since = self
            .checkpoints
            .get()
            .await?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let page = self.remote.pull_since(since, &self.owner_id).await?;

        let mut report = PullReport::default();
        let mut touched_boards: HashSet<Uuid> = HashSet::new();
        for snap in &page.entities {
            match self.apply_pulled(snap).await {
                Ok(SnapshotOutcome::Applied { touched_board }) => {
                    report.applied += 1;
                    if let Some(board_id) = touched_board {
                        touched_boards.insert(board_id);
                    }
                }
                Ok(SnapshotOutcome::KeptLocal) => report.kept_local += 1,
                Err(StoreError::Decode(msg)) | Err(StoreError::Validation(msg)) => {
                    tracing::warn!(
                        entity_id = %snap.id,
                        entity_type = %snap.entity_type,
                        error = %msg,
                        "skipping undecodable remote snapshot"
                    );
                    report.skipped += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let touched: Vec<Uuid> = touched_boards.into_iter().collect();
        report.boards_refreshed = self.recomputer.refresh_all(&touched).await?;

        self.checkpoints.set(page.new_checkpoint).await?;
        Ok(report)
    }

    async fn apply_pulled(&self, snap: &EntitySnapshot) -> Result<SnapshotOutcome, StoreError> {
        let remote_wins = match self
            .snapshots
            .local_snapshot(snap.entity_type, snap.id)
            .await?
        {
            None => true,
            Some(local) => std::ptr::eq(resolve(&local, snap), snap),
        };
        if !remote_wins {
            return Ok(SnapshotOutcome::KeptLocal);
        }

        self.snapshots.apply_remote(snap).await?;

        let touched_board = match snap.entity_type {
            EntityType::Board => Some(snap.id),
            EntityType::Placement => match snap.payload.get("board_id").and_then(|v| v.as_str()) {
                Some(raw) => Some(parse_id(raw)?),
                None => None,
            },
            _ => None,
        };
        Ok(SnapshotOutcome::Applied { touched_board })
    }

    /// One full push-then-pull cycle, guarded against re-entry.
    ///
    /// Returns `None` when a cycle was already running; the running
    /// cycle picks up the queued request and runs a follow-up itself.
    pub async fn sync_cycle(&self) -> Result<Option<(PushReport, PullReport)>, SyncError> {
        if !self.gate.try_enter() {
            tracing::debug!("sync cycle already running, queued a follow-up");
            return Ok(None);
        }

        loop {
            let outcome = async {
                let push = self.push_cycle().await?;
                let pull = self.pull_cycle().await?;
                Ok::<_, SyncError>((push, pull))
            }
            .await;

            match outcome {
                Ok(reports) => {
                    if !self.gate.finish() {
                        return Ok(Some(reports));
                    }
                }
                Err(err) => {
                    self.gate.reset();
                    return Err(err);
                }
            }
        }
    }

    /// Background loop: an immediate cycle on startup (after returning
    /// any interrupted in-flight entries to the queue), then a cycle on
    /// every interval tick or `trigger` call until `shutdown` flips. A
    /// cycle in progress always runs to completion; shutdown is only
    /// observed between cycles, so a batch is never abandoned half-acked.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), SyncError> {
        let requeued = self.queue.requeue_in_flight().await?;
        if requeued > 0 {
            tracing::info!(requeued, "returned interrupted entries to the queue");
        }

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.pull_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                tracing::info!("sync loop shutting down");
                return Ok(());
            }

            match self.sync_cycle().await {
                Ok(Some((push, pull))) => {
                    tracing::debug!(
                        delivered = push.delivered,
                        applied = pull.applied,
                        "sync cycle complete"
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "sync cycle failed, will retry on next tick");
                }
            }
        }
    }
}
