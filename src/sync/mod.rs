//! Background synchronization with the remote store.
//!
//! Push drains the outbound queue in dependency order; pull fetches
//! remote changes since the last checkpoint and routes overlapping
//! entities through the conflict resolver. Neither direction is ever
//! on a local write's critical path: sync failures accumulate in
//! queue and dead-letter state instead of surfacing to callers.

mod engine;
mod http_remote;
mod remote;
mod resolver;

pub use engine::{PullReport, PushReport, SyncEngine};
pub use http_remote::HttpRemoteStore;
pub use remote::{PullPage, PushEntry, PushOutcome, RemoteStore};
pub use resolver::resolve;

use crate::db::StoreError;

/// Errors from sync cycles.
#[derive(Debug)]
pub enum SyncError {
    /// Sync is not configured
    NotConfigured,
    /// Network or remote-store unavailability; retried with backoff
    Transient(String),
    /// Remote rejected the request as invalid; not retried
    Permanent(String),
    /// Local store failure
    Store(StoreError),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotConfigured => {
                write!(f, "Sync not configured. Add server_url and api_key to config.")
            }
            SyncError::Transient(e) => write!(f, "Transient sync error: {}", e),
            SyncError::Permanent(e) => write!(f, "Permanent sync error: {}", e),
            SyncError::Store(e) => write!(f, "Store error during sync: {}", e),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}
