//! Recording session model shared by the producer, the recorder and the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, nothing recorded yet.
    Idle,
    /// Accepting readings.
    Recording,
    /// Final flush and consolidation in progress.
    Stopping,
    /// Finalized; `session.csv` is the durable record.
    Stopped,
    /// Halted by a capacity failure. Previously durable chunks stay servable.
    Error,
}

impl SessionState {
    /// True while the session may still accept readings.
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Recording)
    }
}

/// Parameters for starting a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Mission name; one directory per mission.
    pub mission: String,
    /// Instrument identifier the session belongs to.
    pub sensor_id: String,
    /// Time-based flush interval in seconds (15..=300).
    #[serde(default = "default_chunk_interval_s")]
    pub chunk_interval_s: u64,
    /// Optional caller-chosen session id; generated when absent.
    #[serde(default)]
    pub session_id: Option<String>,
}

const fn default_chunk_interval_s() -> u64 {
    60
}

impl SessionConfig {
    /// Config with the default chunk interval and a generated session id.
    pub fn new(mission: impl Into<String>, sensor_id: impl Into<String>) -> Self {
        Self {
            mission: mission.into(),
            sensor_id: sensor_id.into(),
            chunk_interval_s: default_chunk_interval_s(),
            session_id: None,
        }
    }
}

/// A recording session as owned by its single writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique id within the store.
    pub session_id: String,
    /// Mission the session belongs to.
    pub mission: String,
    /// Instrument identifier.
    pub sensor_id: String,
    /// When recording started (UTC).
    pub started_at: DateTime<Utc>,
    /// When recording was finalized, if it has been.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Current lifecycle state.
    pub state: SessionState,
}

/// Outcome of stopping a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    /// Session that was stopped.
    pub session_id: String,
    /// Final state (`stopped`, or `error` if the session had failed earlier).
    pub state: SessionState,
    /// Readings in the consolidated file, boundary rows excluded.
    pub total_rows: u64,
    /// Sum of all chunk sizes.
    pub total_bytes: u64,
    /// Number of chunks that were consolidated.
    pub chunk_count: usize,
    /// Path of the consolidated `session.csv`, when one was written.
    pub final_path: Option<String>,
    /// Buffered readings that were never durable (lost to a capacity failure).
    pub dropped_rows: u64,
}
