//! `sync_metadata.json`: the per-mission record shared by both sensor roles.
//!
//! Each role updates its own part independently. Every update is a locked
//! read-modify-write followed by an atomic replace, so neither role ever
//! overwrites the other's fields. Once both roles have finished and fusion has
//! recorded its output the record is sealed and further updates are rejected.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use sensor_ingest::{
    clock::{DriftModel, OffsetMeasurement},
    models::{reading::SensorRole, session::SessionState},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    errors::{ErrorClass, is_storage_full},
    fusion::{FusionParams, Strategy},
    store::durable::write_atomic,
};

pub const METADATA_NAME: &str = "sync_metadata.json";

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("sync metadata at {} is sealed", path.display())]
    Sealed { path: PathBuf },

    #[error("sync metadata I/O at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("sync metadata encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl MetadataError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MetadataError::Io { source, .. } if is_storage_full(source) => ErrorClass::Capacity,
            _ => ErrorClass::Consistency,
        }
    }
}

/// One role's session as seen by the pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub session_id: String,
    pub sensor_id: String,
    /// Local directory holding this role's data (mirror for the in-water role).
    pub path: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub total_rows: u64,
    pub total_bytes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SensorRecord {
    pub fn is_finished(&self) -> bool {
        matches!(self.state, SessionState::Stopped | SessionState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionRecord {
    pub strategy: Strategy,
    pub params: FusionParams,
    pub rows: usize,
    pub output: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub mission: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub sensors: BTreeMap<SensorRole, SensorRecord>,
    #[serde(default)]
    pub clock: Option<OffsetMeasurement>,
    #[serde(default)]
    pub drift_model: Option<DriftModel>,
    #[serde(default)]
    pub fusion: Option<FusionRecord>,
}

impl SyncMetadata {
    pub fn new(mission: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            mission: mission.into(),
            created_at: now,
            updated_at: now,
            sensors: BTreeMap::new(),
            clock: None,
            drift_model: None,
            fusion: None,
        }
    }

    pub fn sensor(&self, role: SensorRole) -> Option<&SensorRecord> {
        self.sensors.get(&role)
    }

    /// Both roles finished and fusion recorded.
    pub fn is_sealed(&self) -> bool {
        self.fusion.is_some()
            && [SensorRole::InWater, SensorRole::Surface]
                .iter()
                .all(|r| self.sensors.get(r).is_some_and(SensorRecord::is_finished))
    }
}

pub struct SyncMetadataStore {
    path: PathBuf,
    mission: String,
    lock: Mutex<()>,
}

impl SyncMetadataStore {
    pub fn new(mission_dir: &Path, mission: impl Into<String>) -> Self {
        Self {
            path: mission_dir.join(METADATA_NAME),
            mission: mission.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record. An unparsable file counts as absent.
    pub fn load(&self) -> Result<Option<SyncMetadata>, MetadataError> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MetadataError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(m) => Ok(Some(m)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unparsable sync metadata, starting over");
                Ok(None)
            }
        }
    }

    /// Locked read-modify-write. Creates the record on first use.
    pub fn update(&self, f: impl FnOnce(&mut SyncMetadata)) -> Result<SyncMetadata, MetadataError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Utc::now();
        let mut meta = self.load()?.unwrap_or_else(|| SyncMetadata::new(self.mission.clone(), now));
        if meta.is_sealed() {
            return Err(MetadataError::Sealed {
                path: self.path.clone(),
            });
        }
        f(&mut meta);
        meta.updated_at = now;

        let bytes = serde_json::to_vec_pretty(&meta)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| MetadataError::Io {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        write_atomic(&self.path, &bytes).map_err(|e| MetadataError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(meta)
    }

    pub fn record_sensor(&self, role: SensorRole, record: SensorRecord) -> Result<SyncMetadata, MetadataError> {
        self.update(|m| {
            m.sensors.insert(role, record);
        })
    }

    /// Edits one role's record in place; a no-op when the role never started.
    pub fn update_sensor(
        &self,
        role: SensorRole,
        f: impl FnOnce(&mut SensorRecord),
    ) -> Result<SyncMetadata, MetadataError> {
        self.update(|m| {
            if let Some(rec) = m.sensors.get_mut(&role) {
                f(rec);
            }
        })
    }

    pub fn record_clock(&self, measurement: OffsetMeasurement) -> Result<SyncMetadata, MetadataError> {
        self.update(|m| {
            m.drift_model = DriftModel::from_measurement(&measurement);
            m.clock = Some(measurement);
        })
    }

    pub fn record_fusion(&self, record: FusionRecord) -> Result<SyncMetadata, MetadataError> {
        self.update(|m| m.fusion = Some(record))
    }
}
