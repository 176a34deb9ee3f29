//! Loading finalized session files and persisting the fused dataset.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use sensor_ingest::{io::csv::format_timestamp, models::reading::Reading};

use crate::{
    fusion::{Sample, UnifiedRow},
    store::{StoreError, chunk, durable::write_atomic},
};

pub const UNIFIED_NAME: &str = "unified.csv";
pub const UNIFIED_HEADER: &str =
    "timestamp,inwater_value,surface_value,surface_timestamp_used,surface_age_ms,surface_status";

/// Reads the readings of a finalized `session.csv` (boundary rows dropped).
pub fn load_session_file(path: &Path) -> Result<Vec<Reading>, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    Ok(chunk::decode(&bytes, path)?.readings)
}

pub fn load_samples(path: &Path) -> Result<Vec<Sample>, StoreError> {
    Ok(load_session_file(path)?.iter().map(Sample::from).collect())
}

fn ms_to_rfc3339(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms).map_or_else(|| ms.to_string(), format_timestamp)
}

pub fn encode_unified(rows: &[UnifiedRow]) -> String {
    let mut out = String::with_capacity(64 * (rows.len() + 1));
    out.push_str(UNIFIED_HEADER);
    out.push('\n');
    for r in rows {
        out.push_str(&ms_to_rfc3339(r.timestamp));
        out.push(',');
        if let Some(v) = r.inwater_value {
            out.push_str(&v.to_string());
        }
        out.push(',');
        if let Some(v) = r.surface_value {
            out.push_str(&v.to_string());
        }
        out.push(',');
        if let Some(t) = r.surface_timestamp_used {
            out.push_str(&ms_to_rfc3339(t));
        }
        out.push(',');
        if let Some(age) = r.surface_age_ms {
            out.push_str(&age.to_string());
        }
        out.push(',');
        out.push_str(r.surface_status.as_str());
        out.push('\n');
    }
    out
}

/// Writes `unified.csv` into the mission directory, atomically.
pub fn write_unified_csv(mission_dir: &Path, rows: &[UnifiedRow]) -> Result<PathBuf, StoreError> {
    let path = mission_dir.join(UNIFIED_NAME);
    write_atomic(&path, encode_unified(rows).as_bytes()).map_err(|e| StoreError::io(&path, e))?;
    tracing::info!(path = %path.display(), rows = rows.len(), "unified dataset written");
    Ok(path)
}
