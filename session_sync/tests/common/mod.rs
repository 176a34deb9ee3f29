#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use sensor_ingest::{
    models::{
        api::{ErrorCode, SessionStatus, Snapshot, TimeResponse},
        manifest::{ChunkEntry, Manifest, chunk_name},
        reading::Reading,
        session::{FinalSummary, Session, SessionConfig, SessionState},
    },
    remote::{ByteStream, RemoteError, RemoteNode},
};
use session_sync::store::{ChunkStore, StoreError, StoreOptions, durable::sha256_hex};
use tempfile::TempDir;

pub const T0_MS: i64 = 1_748_779_200_000;

pub fn readings(sensor_id: &str, start_ms: i64, n: usize, step_ms: i64) -> Vec<Reading> {
    (0..n)
        .map(|i| {
            let ts = Utc.timestamp_millis_opt(start_ms + i as i64 * step_ms).unwrap();
            Reading::new(ts, sensor_id, "continuous", i as f64 * 0.5)
        })
        .collect()
}

/// A temp root plus a store over it.
pub struct Fixture {
    pub dir: TempDir,
    pub store: Arc<ChunkStore>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(f: impl FnOnce(&mut StoreOptions)) -> Self {
        session_sync::observability::init_test_logging();
        let dir = TempDir::new().unwrap();
        let mut opts = StoreOptions::new(dir.path().join("producer"));
        f(&mut opts);
        Self {
            store: Arc::new(ChunkStore::new(opts)),
            dir,
        }
    }

    /// Session with `chunks` committed chunks of `rows` readings each.
    pub fn session_with_chunks(&self, chunks: usize, rows: usize) -> String {
        let id = self
            .store
            .start_session(&SessionConfig::new("m1", "uw-01"))
            .unwrap()
            .session_id;
        for c in 0..chunks {
            let start = T0_MS + (c * rows) as i64 * 100;
            self.store.append_readings(&id, readings("uw-01", start, rows, 100)).unwrap();
            self.store.flush(&id).unwrap();
        }
        id
    }
}

fn remote_error(e: StoreError) -> RemoteError {
    let (status, code) = match &e {
        StoreError::SessionNotFound(_) => (404, ErrorCode::SessionNotFound),
        StoreError::FileNotFound { .. } => (404, ErrorCode::ChunkNotFound),
        StoreError::Capacity(_) => (507, ErrorCode::InsufficientStorage),
        StoreError::Conflict(_) | StoreError::NotAccepting { .. } => (409, ErrorCode::SessionConflict),
        StoreError::Invalid(_) => (400, ErrorCode::InvalidRequest),
        _ => (500, ErrorCode::InternalError),
    };
    RemoteError::Api {
        status,
        code,
        detail: e.to_string(),
    }
}

fn frames(bytes: Vec<u8>, frame: usize) -> ByteStream {
    let frames: Vec<Result<Bytes, RemoteError>> = Bytes::from(bytes)
        .chunks(frame.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures::stream::iter(frames))
}

/// In-process producer: a [`RemoteNode`] answering straight from a chunk store.
pub struct StoreNode {
    pub store: Arc<ChunkStore>,
    corrupt: Mutex<HashSet<String>>,
    snapshot_failures: AtomicU32,
    mutations: AtomicU32,
    pub served_bytes: AtomicU64,
    pub frame: usize,
    pub clock_skew_ms: i64,
}

impl StoreNode {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            store,
            corrupt: Mutex::new(HashSet::new()),
            snapshot_failures: AtomicU32::new(0),
            mutations: AtomicU32::new(0),
            served_bytes: AtomicU64::new(0),
            frame: 16 * 1024,
            clock_skew_ms: 0,
        }
    }

    /// Serves `name` with one flipped byte until [`StoreNode::heal`].
    pub fn corrupt(&self, name: &str) {
        self.corrupt.lock().unwrap().insert(name.to_string());
    }

    pub fn heal(&self) {
        self.corrupt.lock().unwrap().clear();
    }

    /// The next `n` snapshot calls fail like a dropped connection.
    pub fn fail_snapshots(&self, n: u32) {
        self.snapshot_failures.store(n, Ordering::SeqCst);
    }

    pub fn served(&self) -> u64 {
        self.served_bytes.load(Ordering::SeqCst)
    }

    /// Session start and stop calls received.
    pub fn mutations(&self) -> u32 {
        self.mutations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteNode for StoreNode {
    async fn snapshot(&self, session_id: &str, since_index: u64) -> Result<Snapshot, RemoteError> {
        let pending = self.snapshot_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.snapshot_failures.store(pending - 1, Ordering::SeqCst);
            return Err(RemoteError::Status {
                status: 503,
                body: "link down".into(),
            });
        }
        self.store.snapshot(session_id, since_index).map_err(remote_error)
    }

    async fn fetch_file(&self, session_id: &str, name: &str) -> Result<ByteStream, RemoteError> {
        let path = self.store.file_path(session_id, name).map_err(remote_error)?;
        let mut bytes = std::fs::read(path).map_err(|e| RemoteError::Decode(e.to_string()))?;
        if self.corrupt.lock().unwrap().contains(name) {
            let mid = bytes.len() / 2;
            bytes[mid] ^= 0x20;
        }
        self.served_bytes.fetch_add(bytes.len() as u64, Ordering::SeqCst);
        Ok(frames(bytes, self.frame))
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, RemoteError> {
        self.store.status(session_id).map_err(remote_error)
    }

    async fn server_time(&self) -> Result<TimeResponse, RemoteError> {
        Ok(TimeResponse {
            server_time_ms: Utc::now().timestamp_millis() + self.clock_skew_ms,
        })
    }

    async fn start_session(&self, config: &SessionConfig) -> Result<Session, RemoteError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.store.start_session(config).map_err(remote_error)
    }

    async fn stop_session(&self, session_id: &str) -> Result<FinalSummary, RemoteError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.store.stop_session(session_id).map_err(remote_error)
    }
}

/// A recording session made of synthetic files, for throughput tests.
pub struct MemoryNode {
    manifest: Manifest,
    files: HashMap<String, Vec<u8>>,
    frame: usize,
    fetched_at: Mutex<Vec<tokio::time::Instant>>,
}

impl MemoryNode {
    /// `count` chunks of exactly `size` bytes each.
    pub fn with_chunks(session_id: &str, count: u64, size: usize, frame: usize) -> Self {
        let t0 = Utc.timestamp_millis_opt(T0_MS).unwrap();
        let mut manifest = Manifest::new(session_id, t0, 60);
        let mut files = HashMap::new();
        for index in 1..=count {
            let bytes: Vec<u8> = (0..size).map(|i| (i as u64 + index) as u8).collect();
            let name = chunk_name(index);
            let entry = ChunkEntry {
                index,
                name: name.clone(),
                size: size as u64,
                sha256: sha256_hex(&bytes),
                row_start: (index - 1) * 10,
                row_end: index * 10,
                row_count: 10,
                timestamp: t0,
            };
            manifest.append_chunk(entry, t0).unwrap();
            files.insert(name, bytes);
        }
        Self {
            manifest,
            files,
            frame,
            fetched_at: Mutex::new(Vec::new()),
        }
    }

    /// When each file request was issued.
    pub fn fetch_times(&self) -> Vec<tokio::time::Instant> {
        self.fetched_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteNode for MemoryNode {
    async fn snapshot(&self, _session_id: &str, since_index: u64) -> Result<Snapshot, RemoteError> {
        let mut manifest = self.manifest.clone();
        manifest.chunks.retain(|c| c.index > since_index);
        Ok(Snapshot {
            state: SessionState::Recording,
            since_index,
            manifest,
        })
    }

    async fn fetch_file(&self, _session_id: &str, name: &str) -> Result<ByteStream, RemoteError> {
        self.fetched_at.lock().unwrap().push(tokio::time::Instant::now());
        match self.files.get(name) {
            Some(bytes) => Ok(frames(bytes.clone(), self.frame)),
            None => Err(RemoteError::Api {
                status: 404,
                code: ErrorCode::ChunkNotFound,
                detail: name.to_string(),
            }),
        }
    }

    async fn session_status(&self, _session_id: &str) -> Result<SessionStatus, RemoteError> {
        Err(RemoteError::Decode("not served".into()))
    }

    async fn server_time(&self) -> Result<TimeResponse, RemoteError> {
        Ok(TimeResponse {
            server_time_ms: Utc::now().timestamp_millis(),
        })
    }

    async fn start_session(&self, _config: &SessionConfig) -> Result<Session, RemoteError> {
        Err(RemoteError::Decode("not served".into()))
    }

    async fn stop_session(&self, _session_id: &str) -> Result<FinalSummary, RemoteError> {
        Err(RemoteError::Decode("not served".into()))
    }
}
