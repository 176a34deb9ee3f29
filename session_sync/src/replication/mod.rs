//! Pull-based replication of a remote session into a local mirror.
//!
//! Each pass follows the same shape:
//!
//! 1. **want**: ask the remote for chunks past the contiguous local prefix
//! 2. **read**: list what the mirror directory already holds
//! 3. **diff**: compute missing, mismatched and finalization work
//! 4. **apply**: download through the bandwidth limiter, verify, write atomically
//!
//! Passes are idempotent. A chunk that fails verification never lands on disk and
//! is retried on a later pass. Once the remote session is stopped and every chunk
//! is mirrored, the mirror is consolidated into `session.csv` and the puller ends.
pub mod apply;
pub mod diff;
pub mod read;
pub mod stats;
pub mod throttle;
pub mod want;

use std::{
    collections::HashMap,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use sensor_ingest::{
    models::api::ErrorCode,
    remote::{RemoteError, RemoteNode},
};
use thiserror::Error;

use crate::{
    errors::ErrorClass,
    schedule::PeriodicTask,
    store::{self, StoreError, manifest},
};

use self::{
    diff::{ChunkDiff, make_diff},
    read::{read_current, scan_current},
    stats::{PullState, StatsHandle, SyncStats},
    throttle::BandwidthLimiter,
    want::Wanted,
};

#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{name}: expected sha256 {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("{name}: expected {expected} bytes, got {actual}")]
    SizeMismatch { name: String, expected: u64, actual: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PullError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PullError::Remote(e) if e.code() == Some(ErrorCode::SessionNotFound) => ErrorClass::NotFound,
            PullError::Remote(_) => ErrorClass::Connectivity,
            PullError::Integrity { .. } | PullError::SizeMismatch { .. } => ErrorClass::Integrity,
            PullError::Store(e) => e.class(),
        }
    }
}

/// Result of one pull pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Remote still recording; `downloaded` chunks mirrored this pass.
    Syncing { downloaded: usize },
    /// Remote finished but the mirror is not final yet.
    Pending,
    /// Mirror holds the final file.
    Finalized,
    /// Remote session ended in error without a final file.
    RemoteFailed,
}

/// Pulls one remote session into one mirror directory.
pub struct Puller {
    remote: Arc<dyn RemoteNode>,
    limiter: Arc<BandwidthLimiter>,
    session_id: String,
    dir: PathBuf,
    stats: StatsHandle,
    remote_stop_seen: AtomicBool,
    quota_bytes: u64,
}

impl Puller {
    /// Opens the mirror. Counters are seeded from what is already on disk, so a
    /// restarted puller does not count those bytes again.
    pub async fn open(
        remote: Arc<dyn RemoteNode>,
        limiter: Arc<BandwidthLimiter>,
        session_id: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> Result<Self, PullError> {
        let session_id = session_id.into();
        let dir = dir.into();

        let seed_dir = dir.clone();
        let (bytes, finalized) = store::blocking(move || {
            let current = read_current(&seed_dir).map_err(|e| StoreError::io(&seed_dir, e))?;
            if current.finalized {
                let total = manifest::load(&seed_dir)?.map_or(0, |m| m.total_bytes);
                Ok((total, true))
            } else {
                Ok((current.bytes(), false))
            }
        })
        .await?;

        let mut initial = SyncStats::new(session_id.clone());
        initial.bytes_mirrored = bytes;
        if finalized {
            initial.state = PullState::Finalized;
        }
        tracing::info!(session_id = %session_id, dir = %dir.display(), bytes, finalized, "puller opened");

        Ok(Self {
            remote,
            limiter,
            session_id,
            dir,
            stats: StatsHandle::new(initial),
            remote_stop_seen: AtomicBool::new(false),
            quota_bytes: 0,
        })
    }

    /// Caps the bytes the mirror may hold. 0 means unlimited.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> Arc<SyncStats> {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> StatsHandle {
        self.stats.clone()
    }

    /// Computes what the next pass would do, without writing anything.
    pub async fn plan(&self) -> Result<ChunkDiff, PullError> {
        plan(&*self.remote, &self.session_id, &self.dir).await
    }

    /// One scheduled tick: a pass, plus one immediate extra pass the first time
    /// the remote is seen stopped without the mirror being final.
    pub async fn tick(&self) -> ControlFlow<()> {
        for _ in 0..2 {
            match self.pass().await {
                Ok(PassOutcome::Finalized) => {
                    self.stats.update(|s| {
                        s.state = PullState::Finalized;
                        s.backlog_count = 0;
                    });
                    return ControlFlow::Break(());
                }
                Ok(PassOutcome::RemoteFailed) => {
                    let message = "remote session ended in error";
                    tracing::warn!(session_id = %self.session_id, "{message}");
                    self.stats.update(|s| {
                        s.state = PullState::Error;
                        s.last_error = Some(message.to_string());
                    });
                    return ControlFlow::Break(());
                }
                Ok(PassOutcome::Pending) if !self.remote_stop_seen.swap(true, Ordering::SeqCst) => {
                    tracing::debug!(session_id = %self.session_id, "remote stopped, catching up");
                    continue;
                }
                Ok(_) => return ControlFlow::Continue(()),
                Err(e) => {
                    self.record_error(&e);
                    if e.class().is_fatal() {
                        self.stats.update(|s| s.state = PullState::Error);
                        return ControlFlow::Break(());
                    }
                    return ControlFlow::Continue(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// want → read → diff → apply.
    pub async fn pass(&self) -> Result<PassOutcome, PullError> {
        let dir = self.dir.clone();
        let current = store::blocking(move || read_current(&dir).map_err(|e| StoreError::io(&dir, e))).await?;
        if current.finalized {
            return Ok(PassOutcome::Finalized);
        }

        let snapshot = self.remote.snapshot(&self.session_id, current.since_index()).await?;
        let wanted = Wanted::from_snapshot(snapshot);
        let diff = make_diff(&wanted, &current);
        let mut backlog = diff.backlog();
        self.stats.update(|s| s.backlog_count = backlog);

        let mut downloaded = 0;
        for entry in diff.downloads() {
            let previous = current.chunks.get(&entry.index).map_or(0, |(_, size)| *size);
            self.check_quota(entry.size, previous)?;
            match apply::download_chunk(&*self.remote, &self.limiter, &self.session_id, entry, &self.dir).await {
                Ok(n) => {
                    downloaded += 1;
                    backlog -= 1;
                    self.stats.update(|s| {
                        s.bytes_mirrored = (s.bytes_mirrored + n).saturating_sub(previous);
                        s.chunks_downloaded += 1;
                        s.backlog_count = backlog;
                    });
                }
                // Consolidated remotes delete their chunks; the final file covers them.
                Err(PullError::Remote(e))
                    if wanted.is_finished() && e.code() == Some(ErrorCode::ChunkNotFound) =>
                {
                    tracing::debug!(session_id = %self.session_id, chunk = %entry.name, "chunk gone on remote");
                    break;
                }
                Err(e) if e.class() == ErrorClass::Integrity => {
                    self.record_error(&e);
                }
                Err(e) => return Err(e),
            }
        }

        if !wanted.is_finished() {
            self.mark_synced();
            return Ok(PassOutcome::Syncing { downloaded });
        }
        let Some(final_file) = diff.finalize.clone() else {
            return Ok(PassOutcome::RemoteFailed);
        };

        let full = self.remote.snapshot(&self.session_id, 0).await?.manifest;
        match apply::finalize(&*self.remote, &self.limiter, &self.session_id, &self.dir, full, &final_file).await {
            Ok(done) => {
                self.stats.update(|s| s.bytes_mirrored += done.downloaded_bytes);
                self.mark_synced();
                Ok(PassOutcome::Finalized)
            }
            Err(e) if e.class() == ErrorClass::Integrity => {
                self.record_error(&e);
                Ok(PassOutcome::Pending)
            }
            Err(e) => Err(e),
        }
    }

    fn check_quota(&self, size: u64, replaced: u64) -> Result<(), PullError> {
        let quota = self.quota_bytes;
        let used = self.stats.snapshot().bytes_mirrored.saturating_sub(replaced);
        if quota > 0 && used + size > quota {
            return Err(PullError::Store(StoreError::Capacity(format!(
                "mirror quota of {quota} bytes exhausted ({used} used, {size} requested)"
            ))));
        }
        Ok(())
    }

    fn mark_synced(&self) {
        let now = Utc::now();
        self.stats.update(|s| s.last_sync_timestamp = Some(now));
    }

    fn record_error(&self, e: &PullError) {
        tracing::warn!(session_id = %self.session_id, class = ?e.class(), error = %e, "pull pass error");
        let message = e.to_string();
        self.stats.update(|s| {
            s.error_count += 1;
            s.last_error = Some(message.clone());
        });
    }
}

/// Dry run: the diff between the remote session and `dir`, read-only.
pub async fn plan(remote: &dyn RemoteNode, session_id: &str, dir: &Path) -> Result<ChunkDiff, PullError> {
    let scan_dir = dir.to_path_buf();
    let current = store::blocking(move || scan_current(&scan_dir).map_err(|e| StoreError::io(&scan_dir, e))).await?;
    if current.finalized {
        return Ok(ChunkDiff {
            finalized: true,
            ..Default::default()
        });
    }
    let snapshot = remote.snapshot(session_id, current.since_index()).await?;
    Ok(make_diff(&Wanted::from_snapshot(snapshot), &current))
}

struct ActiveSync {
    puller: Arc<Puller>,
    task: PeriodicTask,
}

/// Registry of running pullers, one per remote session.
pub struct Replicator {
    limiter: Arc<BandwidthLimiter>,
    mirror_quota_bytes: u64,
    syncs: Mutex<HashMap<String, ActiveSync>>,
}

impl Replicator {
    /// All pullers share one limiter: the cap applies to the link.
    pub fn new(bandwidth_cap_bytes_per_sec: u64) -> Self {
        Self {
            limiter: Arc::new(BandwidthLimiter::new(bandwidth_cap_bytes_per_sec)),
            mirror_quota_bytes: 0,
            syncs: Mutex::new(HashMap::new()),
        }
    }

    /// Quota applied to every mirror this replicator opens. 0 means unlimited.
    pub fn with_mirror_quota(mut self, quota_bytes: u64) -> Self {
        self.mirror_quota_bytes = quota_bytes;
        self
    }

    pub fn limiter(&self) -> Arc<BandwidthLimiter> {
        self.limiter.clone()
    }

    /// Starts pulling `session_id` into `dir` every `poll_interval`. Starting a
    /// session that is already syncing returns its current stats.
    pub async fn start_sync(
        &self,
        session_id: &str,
        remote: Arc<dyn RemoteNode>,
        dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Result<StatsHandle, PullError> {
        if let Some(active) = self.lock().get(session_id) {
            return Ok(active.puller.stats_handle());
        }

        let puller = Arc::new(
            Puller::open(remote, self.limiter.clone(), session_id, dir)
                .await?
                .with_quota(self.mirror_quota_bytes),
        );
        let stats = puller.stats_handle();
        let p = puller.clone();
        let task = PeriodicTask::spawn("replication-pull", poll_interval, move || {
            let p = p.clone();
            async move { p.tick().await }
        });

        let active = ActiveSync { puller, task };
        let raced = {
            let mut syncs = self.lock();
            match syncs.get(session_id) {
                Some(existing) => Some((existing.puller.stats_handle(), active)),
                None => {
                    syncs.insert(session_id.to_string(), active);
                    None
                }
            }
        };
        if let Some((existing, loser)) = raced {
            // Lost a race with a concurrent start.
            loser.task.stop().await;
            return Ok(existing);
        }
        tracing::info!(session_id, ?poll_interval, "sync started");
        Ok(stats)
    }

    /// Stops the puller after one final pass. Returns `None` for unknown sessions.
    pub async fn stop_sync(&self, session_id: &str) -> Option<Arc<SyncStats>> {
        self.finish_sync(session_id, 0, Duration::ZERO).await
    }

    /// Like [`Replicator::stop_sync`], for a remote that has already stopped: after the
    /// final pass, up to `retries` more ticks run `backoff` apart until the mirror is
    /// finalized or a fatal error ends it.
    pub async fn finish_sync(
        &self,
        session_id: &str,
        retries: u32,
        backoff: Duration,
    ) -> Option<Arc<SyncStats>> {
        let active = self.lock().remove(session_id)?;
        active.task.stop().await;
        let mut attempt = 0;
        while attempt < retries && !active.puller.stats().state.is_terminal() {
            attempt += 1;
            tokio::time::sleep(backoff).await;
            tracing::debug!(session_id, attempt, "final pass retry");
            if active.puller.tick().await.is_break() {
                break;
            }
        }
        active.puller.stats.update(|s| {
            if s.state == PullState::Syncing {
                s.state = PullState::Stopped;
            }
        });
        let stats = active.puller.stats();
        tracing::info!(session_id, state = ?stats.state, bytes = stats.bytes_mirrored, "sync stopped");
        Some(stats)
    }

    pub fn stats(&self, session_id: &str) -> Option<Arc<SyncStats>> {
        self.lock().get(session_id).map(|a| a.puller.stats())
    }

    pub fn is_syncing(&self, session_id: &str) -> bool {
        self.lock().get(session_id).is_some_and(|a| !a.task.is_finished())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveSync>> {
        self.syncs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_failures_are_not_fatal() {
        let e = PullError::Integrity {
            name: "chunk_000001.csv".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert_eq!(e.class(), ErrorClass::Integrity);
        assert!(!e.class().is_fatal());

        let full = PullError::Store(StoreError::Capacity("disk full".into()));
        assert!(full.class().is_fatal());

        let gone = PullError::Remote(RemoteError::Api {
            status: 404,
            code: ErrorCode::SessionNotFound,
            detail: "s1".into(),
        });
        assert_eq!(gone.class(), ErrorClass::NotFound);
        assert_eq!(
            PullError::Remote(RemoteError::Decode("bad json".into())).class(),
            ErrorClass::Connectivity
        );
    }
}
