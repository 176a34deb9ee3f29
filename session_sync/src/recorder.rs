//! Local Recorder: persists the surface instrument's reading stream.
//!
//! Two loops per session, both owned by the [`LocalRecorder`]:
//! - ingest: drains the driver channel into the store in batches
//! - flush: a [`PeriodicTask`] rolling the buffer every `chunk_interval_s`
//!
//! The store serializes the two, so a reading is never flushed twice.

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use sensor_ingest::{
    driver::SensorDriver,
    models::{
        reading::Reading,
        session::{FinalSummary, Session, SessionConfig, SessionState},
    },
};
use serde::Serialize;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::ErrorClass,
    schedule::PeriodicTask,
    store::{ChunkStore, StoreError, blocking},
};

/// Readings handed to the store per call at most.
const MAX_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecorderStats {
    pub session_id: String,
    pub state: SessionState,
    pub rows_received: u64,
    pub rows_dropped: u64,
    pub chunks_written: u64,
    pub last_flush: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

type Stats = Arc<ArcSwap<RecorderStats>>;

fn update(stats: &Stats, f: impl Fn(&mut RecorderStats)) {
    stats.rcu(|cur| {
        let mut next = RecorderStats::clone(cur);
        f(&mut next);
        next
    });
}

pub struct LocalRecorder {
    store: Arc<ChunkStore>,
    session: Session,
    cancel: CancellationToken,
    ingest: JoinHandle<()>,
    flusher: PeriodicTask,
    stats: Stats,
}

impl LocalRecorder {
    /// Starts a session in `store` and begins consuming `readings`.
    pub async fn start(
        store: Arc<ChunkStore>,
        config: SessionConfig,
        readings: mpsc::Receiver<Reading>,
    ) -> Result<Self, StoreError> {
        let session = {
            let store = store.clone();
            blocking(move || store.start_session(&config)).await?
        };
        let interval = store.manifest(&session.session_id)?.chunk_interval_s;

        let stats: Stats = Arc::new(ArcSwap::from_pointee(RecorderStats {
            session_id: session.session_id.clone(),
            state: session.state,
            rows_received: 0,
            rows_dropped: 0,
            chunks_written: 0,
            last_flush: None,
            last_error: None,
        }));
        let cancel = CancellationToken::new();

        let ingest = tokio::spawn(ingest_loop(
            store.clone(),
            session.session_id.clone(),
            readings,
            cancel.clone(),
            stats.clone(),
        ));

        let flusher = {
            let store = store.clone();
            let id = session.session_id.clone();
            let stats = stats.clone();
            PeriodicTask::spawn("recorder-flush", Duration::from_secs(interval), move || {
                flush_pass(store.clone(), id.clone(), stats.clone())
            })
        };

        tracing::info!(session_id = %session.session_id, interval_s = interval, "recorder started");
        Ok(Self {
            store,
            session,
            cancel,
            ingest,
            flusher,
            stats,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn stats(&self) -> Arc<RecorderStats> {
        self.stats.load_full()
    }

    /// Drains the channel, runs the final flush, consolidates the session.
    pub async fn stop(self) -> Result<FinalSummary, StoreError> {
        self.cancel.cancel();
        if let Err(e) = self.ingest.await {
            tracing::error!(session_id = %self.session.session_id, error = %e, "ingest task panicked");
        }
        self.flusher.stop().await;

        let id = self.session.session_id.clone();
        let store = self.store.clone();
        let result = blocking(move || store.stop_session(&id)).await;
        match &result {
            Ok(summary) => update(&self.stats, |s| s.state = summary.state),
            Err(e) => update(&self.stats, |s| {
                s.state = SessionState::Error;
                s.last_error = Some(e.to_string());
            }),
        }
        result
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error(transparent)]
    Driver(#[from] sensor_ingest::errors::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RecorderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RecorderError::Driver(_) => ErrorClass::Connectivity,
            RecorderError::Store(e) => e.class(),
        }
    }
}

/// A device driver wired to a [`LocalRecorder`] for one session.
pub struct DriverRecording {
    driver: Box<dyn SensorDriver>,
    recorder: LocalRecorder,
}

impl DriverRecording {
    /// Connects the driver, starts acquisition and records its stream.
    pub async fn start(
        store: Arc<ChunkStore>,
        config: SessionConfig,
        mut driver: Box<dyn SensorDriver>,
    ) -> Result<Self, RecorderError> {
        driver.connect().await?;
        let readings = driver.start_acquisition().await?;
        match LocalRecorder::start(store, config, readings).await {
            Ok(recorder) => Ok(Self { driver, recorder }),
            Err(e) => {
                if let Err(de) = driver.disconnect().await {
                    tracing::warn!(error = %de, "driver disconnect failed");
                }
                Err(e.into())
            }
        }
    }

    pub fn session(&self) -> &Session {
        self.recorder.session()
    }

    pub fn stats(&self) -> Arc<RecorderStats> {
        self.recorder.stats()
    }

    /// Stops acquisition first so the recorder can drain what was delivered.
    pub async fn stop(mut self) -> Result<FinalSummary, RecorderError> {
        let session_id = self.recorder.session().session_id.clone();
        if let Err(e) = self.driver.stop_acquisition().await {
            tracing::warn!(%session_id, error = %e, "stop acquisition failed");
        }
        let summary = self.recorder.stop().await?;
        if let Err(e) = self.driver.disconnect().await {
            tracing::warn!(%session_id, error = %e, "driver disconnect failed");
        }
        Ok(summary)
    }
}

async fn ingest_loop(
    store: Arc<ChunkStore>,
    session_id: String,
    mut rx: mpsc::Receiver<Reading>,
    cancel: CancellationToken,
    stats: Stats,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(first) => {
                    let mut batch = vec![first];
                    while batch.len() < MAX_BATCH {
                        match rx.try_recv() {
                            Ok(r) => batch.push(r),
                            Err(_) => break,
                        }
                    }
                    append(&store, &session_id, batch, &stats).await;
                }
                None => break,
            },
        }
    }

    // Whatever the driver already delivered still belongs to this session.
    rx.close();
    let mut rest = Vec::new();
    while let Ok(r) = rx.try_recv() {
        rest.push(r);
    }
    if !rest.is_empty() {
        append(&store, &session_id, rest, &stats).await;
    }
}

async fn append(store: &Arc<ChunkStore>, session_id: &str, batch: Vec<Reading>, stats: &Stats) {
    let n = batch.len() as u64;
    let result = {
        let store = store.clone();
        let id = session_id.to_string();
        blocking(move || store.append_readings(&id, batch)).await
    };
    match result {
        Ok(rolled) => update(stats, |s| {
            s.rows_received += n;
            s.chunks_written += rolled.len() as u64;
            if !rolled.is_empty() {
                s.last_flush = Some(Utc::now());
            }
        }),
        Err(e) => {
            if e.class() == ErrorClass::Capacity {
                tracing::error!(session_id, error = %e, "recording halted");
            } else {
                tracing::warn!(session_id, error = %e, dropped = n, "readings rejected");
            }
            let state = match &e {
                StoreError::NotAccepting { state, .. } => *state,
                _ if e.class() == ErrorClass::Capacity => SessionState::Error,
                _ => SessionState::Recording,
            };
            update(stats, |s| {
                s.rows_received += n;
                s.rows_dropped += n;
                s.state = state;
                s.last_error = Some(e.to_string());
            });
        }
    }
}

async fn flush_pass(store: Arc<ChunkStore>, session_id: String, stats: Stats) -> ControlFlow<()> {
    let result = {
        let store = store.clone();
        let id = session_id.clone();
        blocking(move || store.flush(&id)).await
    };
    match result {
        Ok(Some(entry)) => {
            update(&stats, |s| {
                s.chunks_written += 1;
                s.last_flush = Some(entry.timestamp);
            });
            ControlFlow::Continue(())
        }
        Ok(None) => ControlFlow::Continue(()),
        Err(e) if e.class() == ErrorClass::Capacity => {
            update(&stats, |s| {
                s.state = SessionState::Error;
                s.last_error = Some(e.to_string());
            });
            ControlFlow::Break(())
        }
        Err(e) => {
            tracing::warn!(%session_id, error = %e, "flush failed; retrying next interval");
            update(&stats, |s| s.last_error = Some(e.to_string()));
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use sensor_ingest::driver::{ReplayDriver, SensorDriver};
    use tempfile::TempDir;

    use super::*;
    use crate::store::StoreOptions;

    fn readings(n: i64) -> Vec<Reading> {
        (0..n)
            .map(|i| {
                let ts = Utc.timestamp_millis_opt(1_748_779_200_000 + i * 100).unwrap();
                Reading::new(ts, "ref-01", "continuous", i as f64)
            })
            .collect()
    }

    #[tokio::test]
    async fn records_a_driver_stream_end_to_end() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ChunkStore::new(StoreOptions::new(dir.path())));

        let mut driver = ReplayDriver::new(readings(500));
        driver.connect().await.unwrap();
        let rx = driver.start_acquisition().await.unwrap();

        let recorder = LocalRecorder::start(store.clone(), SessionConfig::new("m1", "ref-01"), rx)
            .await
            .unwrap();
        let id = recorder.session().session_id.clone();

        // Wait until the replay has been fully consumed.
        while recorder.stats().rows_received < 500 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        driver.stop_acquisition().await.unwrap();

        let summary = recorder.stop().await.unwrap();
        assert_eq!(summary.state, SessionState::Stopped);
        assert_eq!(summary.total_rows, 500);
        assert_eq!(summary.dropped_rows, 0);
        assert_eq!(store.status(&id).unwrap().state, SessionState::Stopped);
    }
}
