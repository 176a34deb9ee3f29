use std::collections::BTreeMap;

use sensor_ingest::models::{
    api::Snapshot,
    manifest::{ChunkEntry, FinalFile, Manifest},
    session::SessionState,
};

/// What the remote says the session contains.
#[derive(Debug, Clone)]
pub struct Wanted {
    pub chunks: BTreeMap<u64, ChunkEntry>,
    pub state: SessionState,
    pub final_file: Option<FinalFile>,
    pub manifest: Manifest,
}

impl Wanted {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let chunks = snapshot
            .manifest
            .chunks
            .iter()
            .map(|c| (c.index, c.clone()))
            .collect();
        Self {
            chunks,
            state: snapshot.state,
            final_file: snapshot.manifest.final_file.clone(),
            manifest: snapshot.manifest,
        }
    }

    /// The remote will not produce more chunks.
    pub fn is_finished(&self) -> bool {
        self.manifest.is_stopped() || matches!(self.state, SessionState::Stopped | SessionState::Error)
    }
}
