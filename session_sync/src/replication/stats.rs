//! Puller stats, published lock-free.
//!
//! The puller is the only writer; status readers call [`StatsHandle::snapshot`]
//! and get an `Arc` of the latest record with one atomic load.

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullState {
    /// Polling the remote.
    Syncing,
    /// Remote stopped and the local mirror holds the consolidated file.
    Finalized,
    /// Halted by a local capacity failure.
    Error,
    /// Stopped by the caller before finalization.
    Stopped,
}

impl PullState {
    /// No further pass can change the mirror.
    pub fn is_terminal(self) -> bool {
        matches!(self, PullState::Finalized | PullState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStats {
    pub session_id: String,
    pub state: PullState,
    pub bytes_mirrored: u64,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub backlog_count: usize,
    pub chunks_downloaded: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl SyncStats {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: PullState::Syncing,
            bytes_mirrored: 0,
            last_sync_timestamp: None,
            backlog_count: 0,
            chunks_downloaded: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsHandle(Arc<ArcSwap<SyncStats>>);

impl StatsHandle {
    pub fn new(initial: SyncStats) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(initial)))
    }

    pub fn snapshot(&self) -> Arc<SyncStats> {
        self.0.load_full()
    }

    /// Copy-on-write update.
    pub fn update(&self, f: impl Fn(&mut SyncStats)) {
        self.0.rcu(|cur| {
            let mut next = SyncStats::clone(cur);
            f(&mut next);
            next
        });
    }
}
