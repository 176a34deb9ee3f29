//! Producer HTTP surface.
//!
//! Serves one [`ChunkStore`] to the replication puller and the clock estimator:
//!
//! - `GET  /snapshots?session_id=&since_index=`
//! - `GET  /files/{session}/{name}` (single byte range supported)
//! - `POST /sessions`, `POST /sessions/{id}/stop`, `GET /sessions`, `GET /sessions/{id}`
//! - `GET  /time`, `GET /health`
//!
//! Errors always use the JSON envelope `{detail, error_code}`. A process-wide
//! governor quota answers 429 `RATE_LIMIT_EXCEEDED` with `Retry-After: 1`.

use std::{collections::HashMap, num::NonZeroU32, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use chrono::Utc;
use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use nonzero_ext::nonzero;
use sensor_ingest::{
    driver::SensorDriver,
    models::{
        api::{ErrorCode, ErrorEnvelope, SessionStatus, Snapshot, TimeResponse},
        session::{FinalSummary, Session, SessionConfig},
    },
};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    recorder::{DriverRecording, RecorderError},
    store::{ChunkStore, StoreError, blocking},
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Builds the instrument driver for a newly started session.
pub type DriverFactory = Arc<dyn Fn(&SessionConfig) -> Box<dyn SensorDriver> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    store: Arc<ChunkStore>,
    recordings: Arc<Mutex<HashMap<String, DriverRecording>>>,
    driver: Option<DriverFactory>,
    limiter: Option<Arc<DirectLimiter>>,
}

impl AppState {
    pub fn new(store: Arc<ChunkStore>) -> Self {
        Self {
            store,
            recordings: Arc::new(Mutex::new(HashMap::new())),
            driver: None,
            limiter: None,
        }
    }

    /// Sessions started over HTTP record from a driver built by `factory`.
    /// Without one, readings must be appended to the store directly.
    pub fn with_driver(mut self, factory: DriverFactory) -> Self {
        self.driver = Some(factory);
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        self.limiter = Some(Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        self
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/time", get(time))
        .route("/snapshots", get(snapshot))
        .route("/files/{session}/{name}", get(file))
        .route("/sessions", post(start_session).get(list_sessions))
        .route("/sessions/{id}", get(session_status))
        .route("/sessions/{id}/stop", post(stop_session))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

/// Serves until `shutdown` is cancelled, then stops active recordings.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "producer listening");
    let recordings = state.recordings.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    let active: Vec<_> = recordings.lock().await.drain().collect();
    for (session_id, recording) in active {
        match recording.stop().await {
            Ok(summary) => tracing::info!(%session_id, rows = summary.total_rows, "recording stopped on shutdown"),
            Err(e) => tracing::error!(%session_id, error = %e, "recording failed to stop"),
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    envelope: ErrorEnvelope,
}

impl ApiError {
    fn new(status: StatusCode, code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            envelope: ErrorEnvelope {
                detail: detail.into(),
                error_code: code,
            },
        }
    }

    fn invalid(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest, detail)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, code) = match &e {
            StoreError::SessionNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::SessionNotFound),
            StoreError::FileNotFound { .. } => (StatusCode::NOT_FOUND, ErrorCode::ChunkNotFound),
            StoreError::Capacity(_) => (StatusCode::INSUFFICIENT_STORAGE, ErrorCode::InsufficientStorage),
            StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, ErrorCode::InvalidRequest),
            StoreError::Conflict(_) | StoreError::NotAccepting { .. } => {
                (StatusCode::CONFLICT, ErrorCode::SessionConflict)
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError),
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "request failed");
        }
        Self::new(status, code, e.to_string())
    }
}

impl From<RecorderError> for ApiError {
    fn from(e: RecorderError) -> Self {
        match e {
            RecorderError::Store(e) => e.into(),
            RecorderError::Driver(e) => {
                tracing::error!(error = %e, "driver failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut resp = (self.status, Json(self.envelope)).into_response();
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        resp
    }
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if let Some(limiter) = &state.limiter {
        if limiter.check().is_err() {
            return ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                ErrorCode::RateLimitExceeded,
                "request quota exceeded",
            )
            .into_response();
        }
    }
    next.run(req).await
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.store.statuses().len(),
        "bytes_used": state.store.bytes_used(),
    }))
}

async fn time() -> Json<TimeResponse> {
    Json(TimeResponse {
        server_time_ms: Utc::now().timestamp_millis(),
    })
}

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    session_id: String,
    #[serde(default)]
    since_index: u64,
}

async fn snapshot(
    State(state): State<AppState>,
    query: Result<Query<SnapshotQuery>, QueryRejection>,
) -> Result<Json<Snapshot>, ApiError> {
    let Query(q) = query.map_err(|e| ApiError::invalid(e.body_text()))?;
    Ok(Json(state.store.snapshot(&q.session_id, q.since_index)?))
}

async fn file(
    State(state): State<AppState>,
    Path((session, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = state.store.file_path(&session, &name)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| StoreError::io(&path, e))?;
    let size = bytes.len() as u64;

    let mut out = HeaderMap::new();
    out.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    out.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"));

    match parse_range(headers.get(header::RANGE), size)? {
        None => Ok((StatusCode::OK, out, Bytes::from(bytes)).into_response()),
        Some((start, end)) => {
            let content_range = format!("bytes {start}-{end}/{size}");
            if let Ok(v) = HeaderValue::from_str(&content_range) {
                out.insert(header::CONTENT_RANGE, v);
            }
            let body = Bytes::from(bytes).slice(start as usize..=end as usize);
            Ok((StatusCode::PARTIAL_CONTENT, out, body).into_response())
        }
    }
}

/// Parses a single `bytes=` range into an inclusive `(start, end)`.
fn parse_range(value: Option<&HeaderValue>, size: u64) -> Result<Option<(u64, u64)>, RangeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let spec = value
        .to_str()
        .ok()
        .and_then(|s| s.trim().strip_prefix("bytes="))
        .ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }
    let (start_s, end_s) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let num = |s: &str| s.trim().parse::<u64>().map_err(|_| RangeError::Malformed);

    if start_s.trim().is_empty() {
        // bytes=-n: the last n bytes
        let n = num(end_s)?;
        if n == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable { size });
        }
        return Ok(Some((size.saturating_sub(n), size - 1)));
    }

    let start = num(start_s)?;
    let end = if end_s.trim().is_empty() { size.saturating_sub(1) } else { num(end_s)? };
    if start >= size || end < start {
        return Err(RangeError::Unsatisfiable { size });
    }
    Ok(Some((start, end.min(size - 1))))
}

#[derive(Debug, PartialEq, Eq)]
enum RangeError {
    Malformed,
    Unsatisfiable { size: u64 },
}

impl From<RangeError> for ApiError {
    fn from(e: RangeError) -> Self {
        match e {
            RangeError::Malformed => ApiError::invalid("malformed Range header"),
            RangeError::Unsatisfiable { size } => ApiError::new(
                StatusCode::RANGE_NOT_SATISFIABLE,
                ErrorCode::InvalidRequest,
                format!("range not satisfiable for {size} bytes"),
            ),
        }
    }
}

async fn start_session(
    State(state): State<AppState>,
    body: Result<Json<SessionConfig>, JsonRejection>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let Json(config) = body.map_err(|e| ApiError::invalid(e.body_text()))?;

    let session = match &state.driver {
        Some(factory) => {
            let driver = factory(&config);
            let recording = DriverRecording::start(state.store.clone(), config, driver).await?;
            let session = recording.session().clone();
            state
                .recordings
                .lock()
                .await
                .insert(session.session_id.clone(), recording);
            session
        }
        None => {
            let store = state.store.clone();
            blocking(move || store.start_session(&config)).await?
        }
    };
    Ok((StatusCode::CREATED, Json(session)))
}

async fn stop_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<FinalSummary>, ApiError> {
    let recording = state.recordings.lock().await.remove(&id);
    let summary = match recording {
        Some(recording) => recording.stop().await?,
        None => {
            let store = state.store.clone();
            blocking(move || store.stop_session(&id)).await?
        }
    };
    Ok(Json(summary))
}

async fn session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatus>, ApiError> {
    Ok(Json(state.store.status(&id)?))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionStatus>> {
    Json(state.store.statuses())
}
