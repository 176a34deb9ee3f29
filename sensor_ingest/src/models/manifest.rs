//! Per-session chunk index.
//!
//! The manifest is the single source of truth for what a session contains. It is
//! only ever replaced wholesale (see the chunk store), so every reader sees either
//! the previous consistent version or the next one.
//!
//! Invariants kept by [`Manifest::append_chunk`]:
//! - `chunks` is append-only and strictly ordered by `index`
//! - each chunk's `row_start` equals the number of rows before it
//! - `total_rows` / `total_bytes` equal the sums over `chunks`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One closed, immutable chunk as advertised in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    /// 1-based, strictly increasing within a session.
    pub index: u64,
    /// File name within the session directory, e.g. `chunk_000001.csv`.
    pub name: String,
    /// Size of the chunk file in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the full chunk byte stream.
    pub sha256: String,
    /// First row (inclusive) in session row numbering.
    pub row_start: u64,
    /// Last row (exclusive); `row_end = row_start + row_count`.
    pub row_end: u64,
    /// Readings in the chunk, boundary rows excluded.
    pub row_count: u64,
    /// When the chunk was committed.
    pub timestamp: DateTime<Utc>,
}

/// The consolidated `session.csv` written when a session stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalFile {
    /// File name within the session directory.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the whole file.
    pub sha256: String,
    /// Readings in the file, boundary rows excluded.
    pub row_count: u64,
}

/// Authoritative index of a session's chunks and aggregate counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Session this manifest describes.
    pub session_id: String,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session was finalized; `None` while recording.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Configured time-based flush interval.
    pub chunk_interval_s: u64,
    /// Chunks in index order.
    pub chunks: Vec<ChunkEntry>,
    /// Sum of `row_count` over `chunks`.
    pub total_rows: u64,
    /// Sum of `size` over `chunks`.
    pub total_bytes: u64,
    /// Last time this manifest was rewritten.
    pub last_updated: DateTime<Utc>,
    /// Consolidated file, present once stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_file: Option<FinalFile>,
}

/// Violations of the manifest invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    /// A chunk index did not strictly increase.
    #[error("chunk index {got} does not follow {last}")]
    OutOfOrder {
        /// Last index already listed.
        last: u64,
        /// Offending index.
        got: u64,
    },
    /// A chunk's row range does not continue the row cursor.
    #[error("chunk {index} starts at row {row_start}, expected {expected}")]
    RowGap {
        /// Offending chunk index.
        index: u64,
        /// Its advertised start row.
        row_start: u64,
        /// Row cursor before it.
        expected: u64,
    },
    /// `row_end`/`row_count` disagree.
    #[error("chunk {index} has inconsistent row range")]
    BadRange {
        /// Offending chunk index.
        index: u64,
    },
    /// Aggregate counters do not match the chunk list.
    #[error("manifest totals do not match its chunks")]
    TotalsMismatch,
    /// The session is already finalized.
    #[error("manifest for session {0} is already stopped")]
    Stopped(String),
}

impl Manifest {
    /// Empty manifest for a freshly started session.
    pub fn new(session_id: impl Into<String>, started_at: DateTime<Utc>, chunk_interval_s: u64) -> Self {
        Self {
            session_id: session_id.into(),
            started_at,
            stopped_at: None,
            chunk_interval_s,
            chunks: Vec::new(),
            total_rows: 0,
            total_bytes: 0,
            last_updated: started_at,
            final_file: None,
        }
    }

    /// Index the next chunk must use.
    pub fn next_index(&self) -> u64 {
        self.chunks.last().map_or(1, |c| c.index + 1)
    }

    /// True once the session was finalized.
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }

    /// Looks up a chunk by file name.
    pub fn chunk(&self, name: &str) -> Option<&ChunkEntry> {
        self.chunks.iter().find(|c| c.name == name)
    }

    /// Appends a chunk, enforcing ordering and row continuity.
    pub fn append_chunk(&mut self, entry: ChunkEntry, now: DateTime<Utc>) -> Result<(), ManifestError> {
        if self.is_stopped() {
            return Err(ManifestError::Stopped(self.session_id.clone()));
        }
        if let Some(last) = self.chunks.last() {
            if entry.index <= last.index {
                return Err(ManifestError::OutOfOrder {
                    last: last.index,
                    got: entry.index,
                });
            }
        }
        if entry.row_start != self.total_rows {
            return Err(ManifestError::RowGap {
                index: entry.index,
                row_start: entry.row_start,
                expected: self.total_rows,
            });
        }
        if entry.row_end != entry.row_start + entry.row_count {
            return Err(ManifestError::BadRange { index: entry.index });
        }
        self.total_rows += entry.row_count;
        self.total_bytes += entry.size;
        self.chunks.push(entry);
        self.last_updated = now;
        Ok(())
    }

    /// Marks the manifest finalized.
    pub fn finalize(&mut self, final_file: FinalFile, now: DateTime<Utc>) {
        self.stopped_at = Some(now);
        self.final_file = Some(final_file);
        self.last_updated = now;
    }

    /// Checks every invariant; used after loading from disk or the network.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut rows = 0u64;
        let mut bytes = 0u64;
        let mut last: Option<u64> = None;
        for c in &self.chunks {
            if let Some(l) = last {
                if c.index <= l {
                    return Err(ManifestError::OutOfOrder { last: l, got: c.index });
                }
            }
            if c.row_start != rows {
                return Err(ManifestError::RowGap {
                    index: c.index,
                    row_start: c.row_start,
                    expected: rows,
                });
            }
            if c.row_end != c.row_start + c.row_count {
                return Err(ManifestError::BadRange { index: c.index });
            }
            rows += c.row_count;
            bytes += c.size;
            last = Some(c.index);
        }
        if rows != self.total_rows || bytes != self.total_bytes {
            return Err(ManifestError::TotalsMismatch);
        }
        Ok(())
    }
}

/// File name for chunk `index`.
pub fn chunk_name(index: u64) -> String {
    format!("chunk_{index:06}.csv")
}

/// Parses a chunk file name back to its index.
pub fn parse_chunk_name(name: &str) -> Option<u64> {
    name.strip_prefix("chunk_")?
        .strip_suffix(".csv")
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))?
        .parse()
        .ok()
}
