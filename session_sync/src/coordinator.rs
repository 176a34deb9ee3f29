//! Façade for the control collaborator.
//!
//! One [`SyncCoordinator`] per mission. The surface role records a local driver
//! through the chunk store. The in-water role starts the session on the remote
//! producer, mirrors it with a puller and measures the clock offset in the
//! background. Each role's lifecycle is merged into `sync_metadata.json`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Utc;
use sensor_ingest::{
    clock::{OffsetMeasurement, measure_offset},
    driver::SensorDriver,
    models::{
        reading::SensorRole,
        session::{FinalSummary, Session, SessionConfig, SessionState},
    },
    remote::{RemoteError, RemoteNode},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    config::Config,
    errors::ErrorClass,
    fusion::{self, dataset},
    metadata::{FusionRecord, MetadataError, SensorRecord, SyncMetadata, SyncMetadataStore},
    recorder::{DriverRecording, RecorderError, RecorderStats},
    replication::{
        PullError, Replicator,
        stats::{PullState, SyncStats},
    },
    store::{ChunkStore, MIRROR_PREFIX, StoreError, StoreOptions, blocking, chunk::FINAL_NAME},
};

/// Extra pull passes after the in-water stop before the mirror is left unfinalized.
const FINAL_PASS_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("{0} sensor is already recording")]
    AlreadyRecording(SensorRole),

    #[error("{0} sensor is not recording")]
    NotRecording(SensorRole),

    #[error("the surface sensor needs a driver")]
    MissingDriver,

    #[error("fusion not ready: {0}")]
    NotReady(String),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Pull(#[from] PullError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CoordinatorError::AlreadyRecording(_)
            | CoordinatorError::NotRecording(_)
            | CoordinatorError::NotReady(_) => ErrorClass::Consistency,
            CoordinatorError::MissingDriver => ErrorClass::Configuration,
            CoordinatorError::Recorder(e) => e.class(),
            CoordinatorError::Remote(_) => ErrorClass::Connectivity,
            CoordinatorError::Pull(e) => e.class(),
            CoordinatorError::Metadata(e) => e.class(),
            CoordinatorError::Store(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub mission: String,
    pub surface: Option<RecorderStats>,
    pub inwater: Option<SyncStats>,
    pub clock: Option<OffsetMeasurement>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FusionStatus {
    pub ready: bool,
    pub inwater_file: Option<PathBuf>,
    pub surface_file: Option<PathBuf>,
    pub waiting_on: Vec<String>,
    pub fused: Option<FusionRecord>,
}

#[derive(Default)]
struct SurfaceSlot {
    recording: Option<DriverRecording>,
    last_stats: Option<RecorderStats>,
}

struct InWaterSlot {
    session: Session,
    active: bool,
    last_stats: Option<SyncStats>,
}

pub struct SyncCoordinator {
    config: Config,
    mission: String,
    mission_dir: PathBuf,
    store: Arc<ChunkStore>,
    remote: Arc<dyn RemoteNode>,
    replicator: Replicator,
    metadata: Arc<SyncMetadataStore>,
    surface: Mutex<SurfaceSlot>,
    inwater: Mutex<Option<InWaterSlot>>,
    clock_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(config: Config, mission: impl Into<String>, remote: Arc<dyn RemoteNode>) -> Self {
        let mission = mission.into();
        let store = Arc::new(ChunkStore::new(StoreOptions::from_config(&config.storage)));
        let mission_dir = store.root().join(&mission);
        let metadata = Arc::new(SyncMetadataStore::new(&mission_dir, mission.clone()));
        let replicator = Replicator::new(config.replication.bandwidth_cap_bytes_per_sec)
            .with_mirror_quota(config.storage.storage_quota_bytes);
        Self {
            config,
            mission,
            mission_dir,
            store,
            remote,
            replicator,
            metadata,
            surface: Mutex::new(SurfaceSlot::default()),
            inwater: Mutex::new(None),
            clock_task: Mutex::new(None),
        }
    }

    pub fn mission_dir(&self) -> &Path {
        &self.mission_dir
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn metadata(&self) -> Result<Option<SyncMetadata>, MetadataError> {
        self.metadata.load()
    }

    fn session_config(&self, sensor_id: &str) -> SessionConfig {
        SessionConfig {
            chunk_interval_s: self.config.storage.chunk_interval_s,
            ..SessionConfig::new(self.mission.clone(), sensor_id)
        }
    }

    /// Starts one role. `driver` is required for the surface role and ignored
    /// for the in-water role, whose instrument lives on the remote node.
    pub async fn start_recording_sensor(
        &self,
        role: SensorRole,
        sensor_id: &str,
        driver: Option<Box<dyn SensorDriver>>,
    ) -> Result<Session, CoordinatorError> {
        match role {
            SensorRole::Surface => self.start_surface(sensor_id, driver).await,
            SensorRole::InWater => self.start_inwater(sensor_id).await,
        }
    }

    async fn start_surface(
        &self,
        sensor_id: &str,
        driver: Option<Box<dyn SensorDriver>>,
    ) -> Result<Session, CoordinatorError> {
        let mut slot = self.surface.lock().await;
        if slot.recording.is_some() {
            return Err(CoordinatorError::AlreadyRecording(SensorRole::Surface));
        }
        let driver = driver.ok_or(CoordinatorError::MissingDriver)?;

        let recording = DriverRecording::start(self.store.clone(), self.session_config(sensor_id), driver).await?;
        let session = recording.session().clone();
        let dir = self.store.session_dir(&session.session_id)?;
        slot.recording = Some(recording);
        slot.last_stats = None;
        drop(slot);

        let record = started_record(&session, &dir);
        self.merge_metadata(move |m| {
            m.sensors.insert(SensorRole::Surface, record);
        })
        .await;
        tracing::info!(mission = %self.mission, role = %SensorRole::Surface, session_id = %session.session_id, "sensor recording");
        Ok(session)
    }

    async fn start_inwater(&self, sensor_id: &str) -> Result<Session, CoordinatorError> {
        let mut slot = self.inwater.lock().await;
        if slot.as_ref().is_some_and(|s| s.active) {
            return Err(CoordinatorError::AlreadyRecording(SensorRole::InWater));
        }

        let session = self.remote.start_session(&self.session_config(sensor_id)).await?;
        let dir = self.mirror_dir(&session.session_id);
        self.replicator
            .start_sync(
                &session.session_id,
                self.remote.clone(),
                dir.clone(),
                self.config.replication.poll_interval(),
            )
            .await?;
        *slot = Some(InWaterSlot {
            session: session.clone(),
            active: true,
            last_stats: None,
        });
        drop(slot);

        let record = started_record(&session, &dir);
        self.merge_metadata(move |m| {
            m.sensors.insert(SensorRole::InWater, record);
        })
        .await;
        self.spawn_clock_measurement().await;
        tracing::info!(mission = %self.mission, role = %SensorRole::InWater, session_id = %session.session_id, "sensor recording");
        Ok(session)
    }

    fn mirror_dir(&self, session_id: &str) -> PathBuf {
        self.mission_dir.join(format!("{MIRROR_PREFIX}{session_id}"))
    }

    /// Fire-and-forget: the outcome, failure included, lands in the metadata.
    async fn spawn_clock_measurement(&self) {
        let remote = self.remote.clone();
        let metadata = self.metadata.clone();
        let round_trips = self.config.clock.round_trips;
        let handle = tokio::spawn(async move {
            let m = measure_offset(&*remote, round_trips).await;
            if let Some(err) = &m.error {
                tracing::warn!(error = %err, "clock offset measurement failed, continuing unsynchronized");
            } else {
                tracing::info!(offset_ms = m.offset_ms, uncertainty_ms = m.uncertainty_ms, "clock offset measured");
            }
            let result = tokio::task::spawn_blocking(move || metadata.record_clock(m)).await;
            match result {
                Ok(Err(e)) => tracing::warn!(error = %e, "clock offset not recorded"),
                Err(e) => tracing::warn!(error = %e, "clock offset task failed"),
                Ok(Ok(_)) => {}
            }
        });
        if let Some(previous) = self.clock_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Waits for the background clock measurement, if one is running.
    pub async fn wait_for_clock(&self) {
        let handle = self.clock_task.lock().await.take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    pub async fn stop_recording_sensor(&self, role: SensorRole) -> Result<FinalSummary, CoordinatorError> {
        match role {
            SensorRole::Surface => self.stop_surface().await,
            SensorRole::InWater => self.stop_inwater().await,
        }
    }

    async fn stop_surface(&self) -> Result<FinalSummary, CoordinatorError> {
        let mut slot = self.surface.lock().await;
        let recording = slot
            .recording
            .take()
            .ok_or(CoordinatorError::NotRecording(SensorRole::Surface))?;
        let mut last = RecorderStats::clone(&recording.stats());
        let summary = recording.stop().await;
        if let Ok(s) = &summary {
            last.state = s.state;
        }
        slot.last_stats = Some(last);
        drop(slot);

        let summary = summary?;
        let s = summary.clone();
        self.merge_metadata(move |m| {
            if let Some(rec) = m.sensors.get_mut(&SensorRole::Surface) {
                rec.state = s.state;
                rec.stopped_at = Some(Utc::now());
                rec.total_rows = s.total_rows;
                rec.total_bytes = s.total_bytes;
                if s.dropped_rows > 0 {
                    rec.last_error = Some(format!("{} readings dropped", s.dropped_rows));
                }
            }
        })
        .await;
        tracing::info!(mission = %self.mission, role = %SensorRole::Surface, rows = summary.total_rows, "sensor stopped");
        Ok(summary)
    }

    /// Stops the remote session, then lets the puller drain and finalize.
    async fn stop_inwater(&self) -> Result<FinalSummary, CoordinatorError> {
        let mut slot = self.inwater.lock().await;
        let session_id = match slot.as_ref() {
            Some(s) if s.active => s.session.session_id.clone(),
            _ => return Err(CoordinatorError::NotRecording(SensorRole::InWater)),
        };

        let summary = self.remote.stop_session(&session_id).await?;
        let stats = self
            .replicator
            .finish_sync(&session_id, FINAL_PASS_RETRIES, self.config.replication.poll_interval())
            .await;
        if let Some(s) = slot.as_mut() {
            s.active = false;
            s.last_stats = stats.as_deref().cloned();
        }
        drop(slot);

        let s = summary.clone();
        self.merge_metadata(move |m| {
            if let Some(rec) = m.sensors.get_mut(&SensorRole::InWater) {
                rec.stopped_at = Some(Utc::now());
                rec.total_rows = s.total_rows;
                match &stats {
                    Some(st) => {
                        rec.total_bytes = st.bytes_mirrored;
                        rec.state = match st.state {
                            PullState::Finalized => SessionState::Stopped,
                            PullState::Error => SessionState::Error,
                            _ => s.state,
                        };
                        rec.last_error = st.last_error.clone();
                    }
                    None => rec.state = s.state,
                }
            }
        })
        .await;
        tracing::info!(mission = %self.mission, role = %SensorRole::InWater, rows = summary.total_rows, "sensor stopped");
        Ok(summary)
    }

    pub async fn get_stats(&self) -> CoordinatorStats {
        let surface = {
            let slot = self.surface.lock().await;
            slot.recording
                .as_ref()
                .map(|r| RecorderStats::clone(&r.stats()))
                .or_else(|| slot.last_stats.clone())
        };
        let inwater = {
            let slot = self.inwater.lock().await;
            slot.as_ref().and_then(|s| {
                self.replicator
                    .stats(&s.session.session_id)
                    .map(|st| SyncStats::clone(&st))
                    .or_else(|| s.last_stats.clone())
            })
        };
        let clock = match self.metadata.load() {
            Ok(m) => m.and_then(|m| m.clock),
            Err(e) => {
                tracing::warn!(error = %e, "sync metadata unreadable");
                None
            }
        };
        CoordinatorStats {
            mission: self.mission.clone(),
            surface,
            inwater,
            clock,
        }
    }

    pub fn get_fusion_status(&self) -> Result<FusionStatus, CoordinatorError> {
        let meta = self.metadata.load()?;
        let mut status = FusionStatus {
            ready: false,
            inwater_file: None,
            surface_file: None,
            waiting_on: Vec::new(),
            fused: meta.as_ref().and_then(|m| m.fusion.clone()),
        };

        for role in [SensorRole::InWater, SensorRole::Surface] {
            let file = meta
                .as_ref()
                .and_then(|m| m.sensor(role))
                .filter(|r| r.state == SessionState::Stopped)
                .map(|r| PathBuf::from(&r.path).join(FINAL_NAME))
                .filter(|p| p.exists());
            match (role, file) {
                (SensorRole::InWater, Some(f)) => status.inwater_file = Some(f),
                (SensorRole::Surface, Some(f)) => status.surface_file = Some(f),
                (_, None) => status.waiting_on.push(role.to_string()),
            }
        }
        status.ready = status.waiting_on.is_empty();
        Ok(status)
    }

    /// Fuses both finalized files into `unified.csv` and records the run.
    pub async fn run_fusion(&self) -> Result<FusionRecord, CoordinatorError> {
        let status = self.get_fusion_status()?;
        let (Some(inwater_file), Some(surface_file)) = (status.inwater_file, status.surface_file) else {
            return Err(CoordinatorError::NotReady(format!(
                "waiting on {}",
                status.waiting_on.join(", ")
            )));
        };

        let drift = self.metadata.load()?.and_then(|m| m.drift_model);
        let strategy = self.config.fusion.strategy;
        let params = self.config.fusion.params();
        let mission_dir = self.mission_dir.clone();

        let (rows, output) = blocking(move || {
            let inwater = dataset::load_samples(&inwater_file)?;
            let surface = dataset::load_samples(&surface_file)?;
            let rows = fusion::fuse(&inwater, &surface, drift.as_ref(), strategy, &params);
            let output = dataset::write_unified_csv(&mission_dir, &rows)?;
            Ok((rows.len(), output))
        })
        .await?;

        let record = FusionRecord {
            strategy,
            params,
            rows,
            output: output.display().to_string(),
            completed_at: Utc::now(),
        };
        let metadata = self.metadata.clone();
        let r = record.clone();
        tokio::task::spawn_blocking(move || metadata.record_fusion(r))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))??;
        tracing::info!(mission = %self.mission, rows, ?strategy, "fusion recorded");
        Ok(record)
    }

    /// Metadata is bookkeeping: failures are logged, never fatal to recording.
    async fn merge_metadata(&self, f: impl FnOnce(&mut SyncMetadata) + Send + 'static) {
        let metadata = self.metadata.clone();
        match tokio::task::spawn_blocking(move || metadata.update(f)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(mission = %self.mission, error = %e, "sync metadata not updated"),
            Err(e) => tracing::warn!(mission = %self.mission, error = %e, "sync metadata task failed"),
        }
    }
}

fn started_record(session: &Session, dir: &Path) -> SensorRecord {
    SensorRecord {
        session_id: session.session_id.clone(),
        sensor_id: session.sensor_id.clone(),
        path: dir.display().to_string(),
        state: SessionState::Recording,
        started_at: session.started_at,
        stopped_at: None,
        total_rows: 0,
        total_bytes: 0,
        last_error: None,
    }
}
