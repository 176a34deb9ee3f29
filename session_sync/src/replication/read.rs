use std::{collections::BTreeMap, fs, io, path::Path};

use sensor_ingest::models::manifest::parse_chunk_name;

use crate::store::{
    chunk::FINAL_NAME,
    durable::{remove_partials, sha256_hex},
    manifest,
};

/// What the local mirror directory currently holds.
#[derive(Debug, Clone, Default)]
pub struct Current {
    /// Chunk files present, by index, with their size.
    pub chunks: BTreeMap<u64, (String, u64)>,
    /// The mirror holds a verified `session.csv` and its stopped manifest.
    pub finalized: bool,
    pub partials_removed: usize,
}

impl Current {
    /// Highest index such that every chunk at or below it is present.
    pub fn since_index(&self) -> u64 {
        let mut since = 0;
        for &index in self.chunks.keys() {
            if index != since + 1 {
                break;
            }
            since = index;
        }
        since
    }

    pub fn bytes(&self) -> u64 {
        self.chunks.values().map(|(_, size)| size).sum()
    }
}

/// Lists the mirror directory, discarding interrupted downloads first.
pub fn read_current(dir: &Path) -> io::Result<Current> {
    if !dir.exists() {
        return Ok(Current::default());
    }
    let partials_removed = remove_partials(dir)?;
    Ok(Current {
        partials_removed,
        ..scan_current(dir)?
    })
}

/// Lists the mirror directory without touching it.
pub fn scan_current(dir: &Path) -> io::Result<Current> {
    let mut current = Current::default();
    if !dir.exists() {
        return Ok(current);
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(index) = parse_chunk_name(&name) {
            current.chunks.insert(index, (name, entry.metadata()?.len()));
        }
    }

    current.finalized = match manifest::load(dir) {
        Ok(Some(m)) => match (&m.final_file, fs::read(dir.join(FINAL_NAME))) {
            (Some(ff), Ok(bytes)) => m.is_stopped() && sha256_hex(&bytes) == ff.sha256,
            _ => false,
        },
        _ => false,
    };
    Ok(current)
}
