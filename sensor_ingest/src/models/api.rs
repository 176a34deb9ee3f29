//! JSON payloads exchanged over the remote node's HTTP surface.

use serde::{Deserialize, Serialize};

use crate::models::{manifest::Manifest, session::SessionState};

/// Response of `GET /snapshots?session_id=&since_index=`.
///
/// `manifest.chunks` only lists chunks with `index > since_index`; the aggregate
/// counters still describe the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Session lifecycle state on the producer.
    pub state: SessionState,
    /// Echo of the requested lower bound (exclusive).
    pub since_index: u64,
    /// Manifest, with the chunk list filtered by `since_index`.
    pub manifest: Manifest,
}

/// Response of `GET /sessions/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Session id.
    pub session_id: String,
    /// Mission name.
    pub mission: String,
    /// Instrument id.
    pub sensor_id: String,
    /// Current state.
    pub state: SessionState,
    /// Durable readings so far.
    pub total_rows: u64,
    /// Durable bytes so far.
    pub total_bytes: u64,
    /// Committed chunks so far.
    pub chunk_count: usize,
    /// Readings buffered but not yet in a chunk.
    pub buffered_rows: u64,
    /// Last session-fatal error, if any.
    pub last_error: Option<String>,
}

/// Response of `GET /time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeResponse {
    /// Producer wall clock, epoch milliseconds.
    pub server_time_ms: i64,
}

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown session id.
    SessionNotFound,
    /// Unknown or already-deleted chunk.
    ChunkNotFound,
    /// Producer storage exhausted.
    InsufficientStorage,
    /// Request quota exceeded.
    RateLimitExceeded,
    /// Malformed request.
    InvalidRequest,
    /// Operation not allowed in the session's state.
    SessionConflict,
    /// Anything else.
    InternalError,
}

impl ErrorCode {
    /// Wire spelling of the code.
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::ChunkNotFound => "CHUNK_NOT_FOUND",
            ErrorCode::InsufficientStorage => "INSUFFICIENT_STORAGE",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::SessionConflict => "SESSION_CONFLICT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent JSON error body: `{ "detail": ..., "error_code": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Human-readable message.
    pub detail: String,
    /// Machine-readable code.
    pub error_code: ErrorCode,
}
