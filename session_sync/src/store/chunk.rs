//! Chunk files and the consolidated session file.

use std::{collections::BTreeMap, fs, io, path::Path};

use chrono::{DateTime, Utc};
use sensor_ingest::{
    io::csv::{self, CsvRow, Marker},
    models::{
        manifest::{ChunkEntry, FinalFile, Manifest, chunk_name, parse_chunk_name},
        reading::Reading,
    },
};

use crate::store::{StoreError, durable::sha256_hex};

/// Name of the consolidated file written when a session stops.
pub const FINAL_NAME: &str = "session.csv";

/// Encodes one chunk: header, `SYNC_START` at `start`, readings, `SYNC_STOP` at `stop`.
pub fn encode_chunk(readings: &[Reading], start: DateTime<Utc>, stop: DateTime<Utc>) -> Vec<u8> {
    csv::encode_document(readings, start, stop).into_bytes()
}

/// Size of `r` once encoded, newline included.
pub fn encoded_len(r: &Reading) -> u64 {
    let mut line = String::with_capacity(96);
    csv::encode_reading(&mut line, r);
    line.len() as u64
}

/// Chunk files in `dir`, by index. Names that do not parse are ignored.
pub fn list_chunks(dir: &Path) -> io::Result<BTreeMap<u64, String>> {
    let mut out = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(index) = parse_chunk_name(&name) {
            out.insert(index, name);
        }
    }
    Ok(out)
}

/// Decoded chunk or session file.
#[derive(Debug)]
pub struct Decoded {
    pub readings: Vec<Reading>,
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

/// Decodes a chunk or session file, keeping the boundary timestamps.
pub fn decode(bytes: &[u8], path: &Path) -> Result<Decoded, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(|e| StoreError::Consistency {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut out = Decoded {
        readings: Vec::new(),
        start: None,
        stop: None,
    };
    for row in csv::parse_document(text)? {
        match row {
            CsvRow::Reading(r) => out.readings.push(r),
            CsvRow::Marker {
                marker: Marker::SyncStart,
                timestamp,
            } => {
                out.start.get_or_insert(timestamp);
            }
            CsvRow::Marker {
                marker: Marker::SyncStop,
                timestamp,
            } => out.stop = Some(timestamp),
        }
    }
    Ok(out)
}

/// Re-derives the manifest entry of a committed chunk file.
///
/// Used when adopting orphans and rebuilding a lost manifest.
pub fn inspect(
    dir: &Path,
    index: u64,
    row_start: u64,
    now: DateTime<Utc>,
) -> Result<(ChunkEntry, Decoded), StoreError> {
    let name = chunk_name(index);
    let path = dir.join(&name);
    let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
    let decoded = decode(&bytes, &path)?;
    let row_count = decoded.readings.len() as u64;
    let entry = ChunkEntry {
        index,
        name,
        size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        row_start,
        row_end: row_start + row_count,
        row_count,
        timestamp: decoded.stop.unwrap_or(now),
    };
    Ok((entry, decoded))
}

/// Rebuilds a manifest from the chunk files in `dir`.
///
/// Chunks are taken in index order up to the first gap. The start time comes from
/// the first chunk's `SYNC_START` row.
pub fn rebuild_manifest(
    dir: &Path,
    session_id: &str,
    chunk_interval_s: u64,
    now: DateTime<Utc>,
) -> Result<Manifest, StoreError> {
    let on_disk = list_chunks(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut manifest = Manifest::new(session_id, now, chunk_interval_s);
    let mut expected = 1;
    for &index in on_disk.keys() {
        if index != expected {
            tracing::warn!(session_id, index, expected, "gap in chunk listing; ignoring later chunks");
            break;
        }
        let (entry, decoded) = inspect(dir, index, manifest.total_rows, now)?;
        if index == 1 {
            if let Some(start) = decoded.start {
                manifest.started_at = start;
            }
        }
        manifest.append_chunk(entry, now)?;
        expected += 1;
    }

    let final_path = dir.join(FINAL_NAME);
    if manifest.chunks.is_empty() && final_path.exists() {
        let bytes = fs::read(&final_path).map_err(|e| StoreError::io(&final_path, e))?;
        let decoded = decode(&bytes, &final_path)?;
        if let Some(start) = decoded.start {
            manifest.started_at = start;
        }
        let final_file = FinalFile {
            name: FINAL_NAME.to_string(),
            size: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
            row_count: decoded.readings.len() as u64,
        };
        manifest.finalize(final_file, decoded.stop.unwrap_or(now));
    }
    manifest.last_updated = now;
    Ok(manifest)
}

/// Concatenates the chunks of `manifest` (index order) into one session file.
///
/// The result has exactly one header, one `SYNC_START` at `started_at` and one
/// `SYNC_STOP` at `stopped_at`. Every chunk is checked against its manifest hash.
pub fn consolidate(
    dir: &Path,
    manifest: &Manifest,
    stopped_at: DateTime<Utc>,
) -> Result<(Vec<u8>, FinalFile), StoreError> {
    let mut readings = Vec::with_capacity(manifest.total_rows as usize);
    for c in &manifest.chunks {
        let path = dir.join(&c.name);
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let actual = sha256_hex(&bytes);
        if actual != c.sha256 {
            return Err(StoreError::Integrity {
                name: c.name.clone(),
                expected: c.sha256.clone(),
                actual,
            });
        }
        readings.extend(decode(&bytes, &path)?.readings);
    }
    if readings.len() as u64 != manifest.total_rows {
        return Err(StoreError::Consistency {
            path: dir.to_path_buf(),
            reason: format!(
                "chunks hold {} readings, manifest lists {}",
                readings.len(),
                manifest.total_rows
            ),
        });
    }

    let bytes = encode_chunk(&readings, manifest.started_at, stopped_at);
    let final_file = FinalFile {
        name: FINAL_NAME.to_string(),
        size: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        row_count: readings.len() as u64,
    };
    Ok((bytes, final_file))
}

/// Deletes the chunk files listed in `manifest`. Missing files are fine.
pub fn remove_chunks(dir: &Path, manifest: &Manifest) -> Result<usize, StoreError> {
    let mut removed = 0;
    for c in &manifest.chunks {
        let path = dir.join(&c.name);
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::store::durable::write_atomic;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_748_779_200_000 + ms).unwrap()
    }

    fn reading(ms: i64) -> Reading {
        Reading::new(at(ms), "ctd-uw-01", "continuous", ms as f64 / 10.0)
    }

    fn commit(dir: &Path, m: &mut Manifest, index: u64, readings: &[Reading]) {
        let bytes = encode_chunk(readings, at(0), at(1000 * index as i64));
        write_atomic(&dir.join(chunk_name(index)), &bytes).unwrap();
        let (entry, _) = inspect(dir, index, m.total_rows, at(0)).unwrap();
        m.append_chunk(entry, at(0)).unwrap();
    }

    #[test]
    fn consolidation_keeps_one_header_and_bracket() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new("s", at(0), 60);
        commit(dir.path(), &mut m, 1, &[reading(10), reading(20)]);
        commit(dir.path(), &mut m, 2, &[reading(30)]);

        let (bytes, ff) = consolidate(dir.path(), &m, at(5000)).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.matches(csv::HEADER).count(), 1);
        assert_eq!(text.matches("SYNC_START").count(), 1);
        assert_eq!(text.matches("SYNC_STOP").count(), 1);
        assert_eq!(text.lines().count(), 1 + 2 + 3);
        assert_eq!(ff.row_count, 3);
        assert_eq!(ff.sha256, sha256_hex(text.as_bytes()));
    }

    #[test]
    fn consolidation_rejects_tampered_chunk() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new("s", at(0), 60);
        commit(dir.path(), &mut m, 1, &[reading(10)]);
        fs::write(dir.path().join(chunk_name(1)), b"tampered").unwrap();
        assert!(matches!(
            consolidate(dir.path(), &m, at(10)),
            Err(StoreError::Integrity { .. })
        ));
    }

    #[test]
    fn rebuild_stops_at_first_gap() {
        let dir = TempDir::new().unwrap();
        let mut m = Manifest::new("s", at(0), 60);
        commit(dir.path(), &mut m, 1, &[reading(10), reading(20)]);
        commit(dir.path(), &mut m, 2, &[reading(30)]);
        fs::write(
            dir.path().join(chunk_name(4)),
            encode_chunk(&[reading(50)], at(0), at(0)),
        )
        .unwrap();

        let rebuilt = rebuild_manifest(dir.path(), "s", 60, at(9000)).unwrap();
        assert_eq!(rebuilt.chunks.len(), 2);
        assert_eq!(rebuilt.total_rows, 3);
        assert_eq!(rebuilt.started_at, at(0));
        assert_eq!(rebuilt.chunks, m.chunks);
        rebuilt.validate().unwrap();
    }
}
