//! Chunk Store: durable, chunked session recording.
//!
//! ## Layout
//! ```text
//! <root>/<mission>/<sensor_id>_<session_id>/
//!     manifest.json
//!     chunk_000001.csv ...   (deleted once consolidated)
//!     session.csv            (written on stop)
//! ```
//!
//! ## Write discipline
//! A roll encodes the buffer, writes the chunk through [`durable::write_atomic`],
//! hashes it, then writes the next manifest the same way. The in-memory manifest and
//! the buffer only advance after both writes succeed, so a reading is either in a
//! committed chunk or still buffered, never both.
//!
//! ## Ownership
//! The store is the session registry. Each session has exactly one slot behind its
//! own mutex; every mutating call holds it for the whole read-modify-write, which
//! serializes flushes against appends.
//!
//! ## Failure
//! A capacity failure (device full, or the configured quota) moves the session to
//! `error`. It stops accepting readings; committed chunks and the manifest stay
//! intact and servable. Any other roll failure leaves the session recording with the
//! readings still buffered; the next flush retries them.
//!
//! The API is synchronous. Async callers go through [`blocking`].

pub mod chunk;
pub mod durable;
pub mod manifest;

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use sensor_ingest::{
    io::csv::CodecError,
    models::{
        api::{SessionStatus, Snapshot},
        manifest::{ChunkEntry, Manifest, ManifestError, chunk_name},
        reading::Reading,
        session::{FinalSummary, Session, SessionConfig, SessionState},
    },
};
use thiserror::Error;

use crate::{
    config::{CHUNK_INTERVAL_RANGE, StorageCfg},
    errors::{ErrorClass, is_storage_full},
    store::{
        chunk::FINAL_NAME,
        durable::{ensure_dir, remove_partials, sha256_hex, sync_dir, write_atomic},
    },
};

/// Directory-name prefix of local replicas; the store never recovers those.
pub const MIRROR_PREFIX: &str = "mirror_";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("file {name} not found in session {session_id}")]
    FileNotFound { session_id: String, name: String },

    #[error("session {0} already exists")]
    Conflict(String),

    #[error("session {session_id} is {state:?} and does not accept readings")]
    NotAccepting {
        session_id: String,
        state: SessionState,
    },

    #[error("invalid session config: {0}")]
    Invalid(String),

    #[error("storage exhausted: {0}")]
    Capacity(String),

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("inconsistent state at {}: {reason}", path.display())]
    Consistency { path: PathBuf, reason: String },

    #[error("manifest update rejected: {0}")]
    Manifest(#[from] ManifestError),

    #[error("undecodable file: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("store task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Wraps an I/O error, promoting "device full" to [`StoreError::Capacity`].
    pub fn io(path: &Path, source: io::Error) -> Self {
        if is_storage_full(&source) {
            StoreError::Capacity(format!("{}: {source}", path.display()))
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::SessionNotFound(_) | StoreError::FileNotFound { .. } => ErrorClass::NotFound,
            StoreError::Conflict(_) | StoreError::NotAccepting { .. } => ErrorClass::Consistency,
            StoreError::Invalid(_) => ErrorClass::Configuration,
            StoreError::Capacity(_) => ErrorClass::Capacity,
            StoreError::Integrity { .. } => ErrorClass::Integrity,
            StoreError::Consistency { .. }
            | StoreError::Manifest(_)
            | StoreError::Codec(_)
            | StoreError::Io { .. }
            | StoreError::Join(_) => ErrorClass::Consistency,
        }
    }
}

/// Runs a store call on the blocking pool.
pub async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub root: PathBuf,
    /// Roll the buffer once its encoded size reaches this many bytes.
    pub max_chunk_bytes: u64,
    /// 0 means unlimited.
    pub storage_quota_bytes: u64,
    /// Interval recorded for sessions whose config did not pick one.
    pub default_chunk_interval_s: u64,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let d = StorageCfg::default();
        Self {
            root: root.into(),
            max_chunk_bytes: d.max_chunk_bytes,
            storage_quota_bytes: d.storage_quota_bytes,
            default_chunk_interval_s: d.chunk_interval_s,
        }
    }

    pub fn from_config(cfg: &StorageCfg) -> Self {
        Self {
            root: cfg.root.clone(),
            max_chunk_bytes: cfg.max_chunk_bytes,
            storage_quota_bytes: cfg.storage_quota_bytes,
            default_chunk_interval_s: cfg.chunk_interval_s,
        }
    }
}

/// What [`ChunkStore::recover`] found.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    pub sessions: Vec<String>,
    pub partials_removed: usize,
    pub orphans_adopted: usize,
    pub manifests_rebuilt: usize,
    pub leftover_chunks_removed: usize,
}

struct SessionSlot {
    session: Session,
    dir: PathBuf,
    manifest: Manifest,
    buffer: Vec<Reading>,
    buffer_bytes: u64,
    window_start: DateTime<Utc>,
    dropped_rows: u64,
    last_error: Option<String>,
    summary: Option<FinalSummary>,
}

impl SessionSlot {
    fn fail(&mut self, err: &StoreError) {
        tracing::error!(
            session_id = %self.session.session_id,
            error = %err,
            buffered = self.buffer.len(),
            "session halted"
        );
        self.session.state = SessionState::Error;
        self.last_error = Some(err.to_string());
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session.session_id.clone(),
            mission: self.session.mission.clone(),
            sensor_id: self.session.sensor_id.clone(),
            state: self.session.state,
            total_rows: self.manifest.total_rows,
            total_bytes: self.manifest.total_bytes,
            chunk_count: self.manifest.chunks.len(),
            buffered_rows: self.buffer.len() as u64,
            last_error: self.last_error.clone(),
        }
    }

    fn error_summary(&mut self) -> FinalSummary {
        let summary = FinalSummary {
            session_id: self.session.session_id.clone(),
            state: SessionState::Error,
            total_rows: self.manifest.total_rows,
            total_bytes: self.manifest.total_bytes,
            chunk_count: self.manifest.chunks.len(),
            final_path: None,
            dropped_rows: self.dropped_rows + self.buffer.len() as u64,
        };
        self.dropped_rows = summary.dropped_rows;
        self.buffer.clear();
        self.buffer_bytes = 0;
        summary
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_path_component(what: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty()
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.contains(char::is_control)
    {
        return Err(StoreError::Invalid(format!("{what} {value:?} is not a valid name")));
    }
    Ok(())
}

/// Registry and writer for every session on this node.
pub struct ChunkStore {
    opts: StoreOptions,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionSlot>>>>,
    bytes_used: AtomicU64,
}

impl ChunkStore {
    pub fn new(opts: StoreOptions) -> Self {
        Self {
            opts,
            sessions: Mutex::new(HashMap::new()),
            bytes_used: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.opts.root
    }

    /// Bytes currently held by chunk and session files.
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::SeqCst)
    }

    fn slot(&self, session_id: &str) -> Result<Arc<Mutex<SessionSlot>>, StoreError> {
        lock(&self.sessions)
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    fn check_quota(&self, extra: u64) -> Result<(), StoreError> {
        let quota = self.opts.storage_quota_bytes;
        let used = self.bytes_used();
        if quota > 0 && used + extra > quota {
            return Err(StoreError::Capacity(format!(
                "quota of {quota} bytes exhausted ({used} used, {extra} requested)"
            )));
        }
        Ok(())
    }

    /// Creates the session directory and its empty manifest.
    pub fn start_session(&self, config: &SessionConfig) -> Result<Session, StoreError> {
        check_path_component("mission", &config.mission)?;
        check_path_component("sensor_id", &config.sensor_id)?;
        let session_id = match &config.session_id {
            Some(id) => id.clone(),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        check_path_component("session_id", &session_id)?;
        if session_id.contains('_') {
            return Err(StoreError::Invalid(format!(
                "session_id {session_id:?} must not contain '_'"
            )));
        }

        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session_id) {
            return Err(StoreError::Conflict(session_id));
        }

        let dir = self
            .opts
            .root
            .join(&config.mission)
            .join(format!("{}_{}", config.sensor_id, session_id));
        if dir.join(manifest::MANIFEST_NAME).exists() {
            return Err(StoreError::Conflict(session_id));
        }
        ensure_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let now = Utc::now();
        let interval = config
            .chunk_interval_s
            .clamp(*CHUNK_INTERVAL_RANGE.start(), *CHUNK_INTERVAL_RANGE.end());
        let m = Manifest::new(&session_id, now, interval);
        manifest::save(&dir, &m)?;

        let session = Session {
            session_id: session_id.clone(),
            mission: config.mission.clone(),
            sensor_id: config.sensor_id.clone(),
            started_at: now,
            stopped_at: None,
            state: SessionState::Recording,
        };
        sessions.insert(
            session_id.clone(),
            Arc::new(Mutex::new(SessionSlot {
                session: session.clone(),
                dir: dir.clone(),
                manifest: m,
                buffer: Vec::new(),
                buffer_bytes: 0,
                window_start: now,
                dropped_rows: 0,
                last_error: None,
                summary: None,
            })),
        );
        tracing::info!(%session_id, dir = %dir.display(), "session started");
        Ok(session)
    }

    /// Buffers readings, rolling a chunk whenever the buffer reaches the size cap.
    ///
    /// Returns the chunks committed by size-based rolls during this call. A roll that
    /// fails for any reason other than capacity keeps the whole batch buffered for the
    /// next flush and is only reported through the session status.
    pub fn append_readings(
        &self,
        session_id: &str,
        readings: Vec<Reading>,
    ) -> Result<Vec<ChunkEntry>, StoreError> {
        let slot = self.slot(session_id)?;
        let mut slot = lock(&slot);
        if !slot.session.state.is_active() {
            return Err(StoreError::NotAccepting {
                session_id: session_id.to_string(),
                state: slot.session.state,
            });
        }
        slot.session.state = SessionState::Recording;

        let mut rolled = Vec::new();
        let mut pending = readings.into_iter();
        while let Some(r) = pending.next() {
            slot.buffer_bytes += chunk::encoded_len(&r);
            slot.buffer.push(r);
            if slot.buffer_bytes < self.opts.max_chunk_bytes {
                continue;
            }
            match self.roll(&mut slot) {
                Ok(Some(entry)) => rolled.push(entry),
                Ok(None) => {}
                Err(e) if e.class() == ErrorClass::Capacity => {
                    slot.dropped_rows += pending.len() as u64;
                    return Err(e);
                }
                Err(e) => {
                    for r in pending.by_ref() {
                        slot.buffer_bytes += chunk::encoded_len(&r);
                        slot.buffer.push(r);
                    }
                    tracing::warn!(
                        session_id,
                        error = %e,
                        buffered = slot.buffer.len(),
                        "chunk roll failed, keeping readings buffered"
                    );
                    slot.last_error = Some(e.to_string());
                }
            }
        }
        Ok(rolled)
    }

    /// Rolls buffered readings into a new chunk. No-op when nothing is buffered.
    pub fn flush(&self, session_id: &str) -> Result<Option<ChunkEntry>, StoreError> {
        let slot = self.slot(session_id)?;
        let mut slot = lock(&slot);
        if !slot.session.state.is_active() {
            return Ok(None);
        }
        self.roll(&mut slot)
    }

    fn roll(&self, slot: &mut SessionSlot) -> Result<Option<ChunkEntry>, StoreError> {
        if slot.buffer.is_empty() {
            return Ok(None);
        }
        match self.write_chunk(slot) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                if e.class() == ErrorClass::Capacity {
                    slot.fail(&e);
                }
                Err(e)
            }
        }
    }

    fn write_chunk(&self, slot: &mut SessionSlot) -> Result<ChunkEntry, StoreError> {
        let now = Utc::now();
        let index = slot.manifest.next_index();
        let name = chunk_name(index);
        let bytes = chunk::encode_chunk(&slot.buffer, slot.window_start, now);
        let size = bytes.len() as u64;
        self.check_quota(size)?;

        let path = slot.dir.join(&name);
        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;

        let row_count = slot.buffer.len() as u64;
        let row_start = slot.manifest.total_rows;
        let entry = ChunkEntry {
            index,
            name,
            size,
            sha256: sha256_hex(&bytes),
            row_start,
            row_end: row_start + row_count,
            row_count,
            timestamp: now,
        };
        let mut next = slot.manifest.clone();
        next.append_chunk(entry.clone(), now)?;
        manifest::save(&slot.dir, &next)?;

        slot.manifest = next;
        slot.buffer.clear();
        slot.buffer_bytes = 0;
        slot.window_start = now;
        self.bytes_used.fetch_add(size, Ordering::SeqCst);
        tracing::debug!(
            session_id = %slot.session.session_id,
            chunk = %entry.name,
            bytes = size,
            rows = row_count,
            "chunk committed"
        );
        Ok(entry)
    }

    /// Flushes, consolidates into `session.csv`, deletes the chunks, marks the manifest stopped.
    ///
    /// Stopping twice returns the first summary. A session already in `error` is not
    /// consolidated; its chunks stay in place.
    pub fn stop_session(&self, session_id: &str) -> Result<FinalSummary, StoreError> {
        let slot = self.slot(session_id)?;
        let mut slot = lock(&slot);
        if let Some(summary) = &slot.summary {
            return Ok(summary.clone());
        }
        if slot.session.state == SessionState::Error {
            let summary = slot.error_summary();
            slot.summary = Some(summary.clone());
            return Ok(summary);
        }

        slot.session.state = SessionState::Stopping;
        match self.finalize(&mut slot) {
            Ok(summary) => {
                slot.summary = Some(summary.clone());
                Ok(summary)
            }
            Err(e) => {
                if slot.session.state != SessionState::Error {
                    slot.fail(&e);
                }
                Err(e)
            }
        }
    }

    fn finalize(&self, slot: &mut SessionSlot) -> Result<FinalSummary, StoreError> {
        self.roll(slot)?;

        let now = Utc::now();
        let (bytes, final_file) = chunk::consolidate(&slot.dir, &slot.manifest, now)?;
        self.check_quota(final_file.size)?;
        let final_path = slot.dir.join(FINAL_NAME);
        write_atomic(&final_path, &bytes).map_err(|e| StoreError::io(&final_path, e))?;

        let mut next = slot.manifest.clone();
        next.finalize(final_file.clone(), now);
        manifest::save(&slot.dir, &next)?;
        slot.manifest = next;

        let removed = chunk::remove_chunks(&slot.dir, &slot.manifest)?;
        sync_dir(&slot.dir).map_err(|e| StoreError::io(&slot.dir, e))?;
        let chunk_bytes = slot.manifest.total_bytes;
        let _ = self
            .bytes_used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some((used + final_file.size).saturating_sub(chunk_bytes))
            });

        slot.session.state = SessionState::Stopped;
        slot.session.stopped_at = Some(now);
        let summary = FinalSummary {
            session_id: slot.session.session_id.clone(),
            state: SessionState::Stopped,
            total_rows: slot.manifest.total_rows,
            total_bytes: slot.manifest.total_bytes,
            chunk_count: slot.manifest.chunks.len(),
            final_path: Some(final_path.display().to_string()),
            dropped_rows: slot.dropped_rows,
        };
        tracing::info!(
            session_id = %summary.session_id,
            rows = summary.total_rows,
            chunks = summary.chunk_count,
            removed,
            "session stopped"
        );
        Ok(summary)
    }

    pub fn session(&self, session_id: &str) -> Result<Session, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        Ok(slot.session.clone())
    }

    pub fn status(&self, session_id: &str) -> Result<SessionStatus, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        Ok(slot.status())
    }

    /// Status of every registered session, ordered by id.
    pub fn statuses(&self) -> Vec<SessionStatus> {
        let slots: Vec<_> = lock(&self.sessions).values().cloned().collect();
        let mut out: Vec<_> = slots.iter().map(|s| lock(s).status()).collect();
        out.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        out
    }

    pub fn manifest(&self, session_id: &str) -> Result<Manifest, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        Ok(slot.manifest.clone())
    }

    /// Session directory.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        Ok(slot.dir.clone())
    }

    /// Manifest restricted to chunks after `since_index`; totals are unchanged.
    pub fn snapshot(&self, session_id: &str, since_index: u64) -> Result<Snapshot, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        let mut manifest = slot.manifest.clone();
        manifest.chunks.retain(|c| c.index > since_index);
        Ok(Snapshot {
            state: slot.session.state,
            since_index,
            manifest,
        })
    }

    /// Path of a servable file: a listed chunk still on disk, or the consolidated file.
    pub fn file_path(&self, session_id: &str, name: &str) -> Result<PathBuf, StoreError> {
        let slot = self.slot(session_id)?;
        let slot = lock(&slot);
        let listed = slot.manifest.chunk(name).is_some()
            || (name == FINAL_NAME && slot.manifest.final_file.is_some());
        let path = slot.dir.join(name);
        if listed && path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::FileNotFound {
                session_id: session_id.to_string(),
                name: name.to_string(),
            })
        }
    }

    /// Rebuilds the registry from disk after a restart.
    ///
    /// For every `<mission>/<sensor_id>_<session_id>/` directory: temporaries are
    /// deleted, the manifest is loaded (or rebuilt from the chunk listing when it is
    /// missing or unparsable), committed chunks the manifest never listed are
    /// adopted, and chunk files a finished consolidation left behind are removed.
    /// Unfinished sessions come back `idle`; they accept readings or a stop.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();
        let root = &self.opts.root;
        let missions = match fs::read_dir(root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(StoreError::io(root, e)),
        };
        for mission in missions {
            let mission = mission.map_err(|e| StoreError::io(root, e))?;
            if !mission.path().is_dir() {
                continue;
            }
            let mission_name = mission.file_name().to_string_lossy().into_owned();
            let mission_dir = mission.path();
            let entries = fs::read_dir(&mission_dir).map_err(|e| StoreError::io(&mission_dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(&mission_dir, e))?;
                let dir = entry.path();
                let dir_name = entry.file_name().to_string_lossy().into_owned();
                if !dir.is_dir() || dir_name.starts_with(MIRROR_PREFIX) {
                    continue;
                }
                let Some((sensor_id, session_id)) = dir_name.rsplit_once('_') else {
                    continue;
                };
                self.recover_dir(&mission_name, sensor_id, session_id, &dir, &mut report)?;
            }
        }
        report.sessions.sort();
        tracing::info!(?report, "recovery finished");
        Ok(report)
    }

    fn recover_dir(
        &self,
        mission: &str,
        sensor_id: &str,
        session_id: &str,
        dir: &Path,
        report: &mut RecoveryReport,
    ) -> Result<(), StoreError> {
        if lock(&self.sessions).contains_key(session_id) {
            return Ok(());
        }
        report.partials_removed += remove_partials(dir).map_err(|e| StoreError::io(dir, e))?;
        let now = Utc::now();
        let on_disk = chunk::list_chunks(dir).map_err(|e| StoreError::io(dir, e))?;

        let loaded = match manifest::load(dir) {
            Ok(m) => m,
            Err(e @ StoreError::Consistency { .. }) => {
                tracing::warn!(session_id, error = %e, "manifest unreadable; rebuilding from chunk listing");
                None
            }
            Err(e) => return Err(e),
        };
        let mut m = match loaded {
            Some(m) => m,
            None => {
                if on_disk.is_empty() && !dir.join(FINAL_NAME).exists() {
                    return Ok(());
                }
                let rebuilt =
                    chunk::rebuild_manifest(dir, session_id, self.opts.default_chunk_interval_s, now)?;
                manifest::save(dir, &rebuilt)?;
                report.manifests_rebuilt += 1;
                rebuilt
            }
        };

        let state = if m.is_stopped() {
            for name in on_disk.values() {
                let path = dir.join(name);
                fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
                report.leftover_chunks_removed += 1;
            }
            SessionState::Stopped
        } else {
            let last = m.chunks.last().map_or(0, |c| c.index);
            let mut adopted = 0;
            for &index in on_disk.range(last + 1..).map(|(i, _)| i) {
                if index != m.next_index() {
                    break;
                }
                let entry = match chunk::inspect(dir, index, m.total_rows, now) {
                    Ok((entry, _)) => entry,
                    Err(e) => {
                        tracing::warn!(session_id, index, error = %e, "orphan chunk not adoptable");
                        break;
                    }
                };
                m.append_chunk(entry, now)?;
                adopted += 1;
            }
            if adopted > 0 {
                manifest::save(dir, &m)?;
                tracing::info!(session_id, adopted, "adopted orphan chunks");
            }
            report.orphans_adopted += adopted;
            SessionState::Idle
        };

        let held = match (&m.final_file, state) {
            (Some(f), SessionState::Stopped) => f.size,
            _ => m.total_bytes,
        };
        self.bytes_used.fetch_add(held, Ordering::SeqCst);

        let session = Session {
            session_id: m.session_id.clone(),
            mission: mission.to_string(),
            sensor_id: sensor_id.to_string(),
            started_at: m.started_at,
            stopped_at: m.stopped_at,
            state,
        };
        let summary = (state == SessionState::Stopped).then(|| FinalSummary {
            session_id: m.session_id.clone(),
            state,
            total_rows: m.final_file.as_ref().map_or(m.total_rows, |f| f.row_count),
            total_bytes: m.total_bytes,
            chunk_count: m.chunks.len(),
            final_path: Some(dir.join(FINAL_NAME).display().to_string()),
            dropped_rows: 0,
        });
        report.sessions.push(m.session_id.clone());
        lock(&self.sessions).insert(
            m.session_id.clone(),
            Arc::new(Mutex::new(SessionSlot {
                session,
                dir: dir.to_path_buf(),
                window_start: now,
                manifest: m,
                buffer: Vec::new(),
                buffer_bytes: 0,
                dropped_rows: 0,
                last_error: None,
                summary,
            })),
        );
        Ok(())
    }
}
