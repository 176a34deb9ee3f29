mod common;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use common::{Fixture, T0_MS, readings};
use sensor_ingest::{
    driver::{ReplayDriver, SensorDriver},
    models::{
        api::{ErrorCode, ErrorEnvelope, SessionStatus, Snapshot},
        manifest::chunk_name,
        session::{FinalSummary, Session, SessionConfig, SessionState},
    },
    remote::{RemoteNode, http_rest::HttpRemote},
};
use serde::de::DeserializeOwned;
use session_sync::{
    replication::{PassOutcome, Puller, throttle::BandwidthLimiter},
    server::{AppState, DriverFactory, router, serve},
    store::chunk::FINAL_NAME,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn json<T: DeserializeOwned>(body: &[u8]) -> T {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn snapshot_lists_chunks_after_since_index() {
    let fx = Fixture::new();
    let id = fx.session_with_chunks(3, 2);
    let app = router(AppState::new(fx.store.clone()));

    let (status, _, body) = send(&app, get(&format!("/snapshots?session_id={id}&since_index=1"))).await;
    assert_eq!(status, StatusCode::OK);
    let snap: Snapshot = json(&body);
    assert_eq!(snap.since_index, 1);
    assert_eq!(snap.state, SessionState::Recording);
    let names: Vec<_> = snap.manifest.chunks.iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec![chunk_name(2), chunk_name(3)]);
    assert_eq!(snap.manifest.total_rows, 6);
}

#[tokio::test]
async fn unknown_session_uses_error_envelope() {
    let fx = Fixture::new();
    let app = router(AppState::new(fx.store.clone()));

    let (status, _, body) = send(&app, get("/snapshots?session_id=nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let env: ErrorEnvelope = json(&body);
    assert_eq!(env.error_code, ErrorCode::SessionNotFound);

    let (status, _, body) = send(&app, get("/snapshots")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json::<ErrorEnvelope>(&body).error_code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn files_support_single_ranges() {
    let fx = Fixture::new();
    let id = fx.session_with_chunks(1, 4);
    let app = router(AppState::new(fx.store.clone()));
    let full = std::fs::read(fx.store.file_path(&id, &chunk_name(1)).unwrap()).unwrap();
    let uri = format!("/files/{id}/{}", chunk_name(1));

    let (status, headers, body) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(body, full);

    let req = Request::get(&uri).header(header::RANGE, "bytes=0-9").body(Body::empty()).unwrap();
    let (status, headers, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, full[..10].to_vec());
    assert_eq!(
        headers[header::CONTENT_RANGE].to_str().unwrap(),
        format!("bytes 0-9/{}", full.len())
    );

    let req = Request::get(&uri)
        .header(header::RANGE, format!("bytes={}-", full.len()))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
}

#[tokio::test]
async fn missing_chunk_is_404() {
    let fx = Fixture::new();
    let id = fx.session_with_chunks(1, 2);
    let app = router(AppState::new(fx.store.clone()));

    let (status, _, body) = send(&app, get(&format!("/files/{id}/{}", chunk_name(9)))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json::<ErrorEnvelope>(&body).error_code, ErrorCode::ChunkNotFound);
}

#[tokio::test]
async fn quota_rejects_with_retry_after() {
    let fx = Fixture::new();
    let app = router(AppState::new(fx.store.clone()).with_rate_limit(2));

    for _ in 0..2 {
        let (status, _, _) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "1");
    assert_eq!(json::<ErrorEnvelope>(&body).error_code, ErrorCode::RateLimitExceeded);
}

#[tokio::test]
async fn sessions_start_and_stop_over_http() {
    let fx = Fixture::new();
    let app = router(AppState::new(fx.store.clone()));

    let config = serde_json::to_vec(&SessionConfig::new("m1", "uw-01")).unwrap();
    let req = Request::post("/sessions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(config))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let session: Session = json(&body);

    fx.store
        .append_readings(&session.session_id, readings("uw-01", T0_MS, 5, 100))
        .unwrap();
    let (_, _, body) = send(&app, get(&format!("/sessions/{}", session.session_id))).await;
    assert_eq!(json::<SessionStatus>(&body).buffered_rows, 5);

    let stop = Request::post(format!("/sessions/{}/stop", session.session_id))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, stop).await;
    assert_eq!(status, StatusCode::OK);
    let summary: FinalSummary = json(&body);
    assert_eq!(summary.state, SessionState::Stopped);
    assert_eq!(summary.total_rows, 5);

    let (status, _, body) = send(&app, get(&format!("/files/{}/{FINAL_NAME}", session.session_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(body).unwrap().lines().count(), 5 + 3);
}

#[tokio::test]
async fn malformed_start_body_is_400() {
    let fx = Fixture::new();
    let app = router(AppState::new(fx.store.clone()));
    let req = Request::post("/sessions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"mission\": 3}"))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json::<ErrorEnvelope>(&body).error_code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn driver_backed_session_records_every_reading() {
    let fx = Fixture::new();
    let factory: DriverFactory = Arc::new(|config: &SessionConfig| -> Box<dyn SensorDriver> {
        Box::new(ReplayDriver::new(readings(&config.sensor_id, T0_MS, 50, 100)))
    });
    let app = router(AppState::new(fx.store.clone()).with_driver(factory));

    let req = Request::post("/sessions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&SessionConfig::new("m1", "sf-01")).unwrap()))
        .unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json::<Session>(&body).session_id;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let s = fx.store.status(&id).unwrap();
        if s.total_rows + s.buffered_rows == 50 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "replay never drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stop = Request::post(format!("/sessions/{id}/stop")).body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, stop).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json::<FinalSummary>(&body).total_rows, 50);
}

#[tokio::test]
async fn puller_mirrors_over_real_http() {
    let fx = Fixture::new();
    let id = fx.session_with_chunks(2, 6);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(serve(listener, AppState::new(fx.store.clone()), shutdown.clone()));

    let remote: Arc<dyn RemoteNode> =
        Arc::new(HttpRemote::new(&format!("http://{addr}"), Duration::from_secs(5)).unwrap());
    let dir = TempDir::new().unwrap();
    let puller = Puller::open(remote.clone(), Arc::new(BandwidthLimiter::new(0)), &id, dir.path().join("m"))
        .await
        .unwrap();

    assert_eq!(puller.pass().await.unwrap(), PassOutcome::Syncing { downloaded: 2 });
    remote.stop_session(&id).await.unwrap();
    assert_eq!(puller.pass().await.unwrap(), PassOutcome::Finalized);
    assert_eq!(
        std::fs::read(dir.path().join("m").join(FINAL_NAME)).unwrap(),
        std::fs::read(fx.store.file_path(&id, FINAL_NAME).unwrap()).unwrap()
    );
    assert!(remote.server_time().await.unwrap().server_time_ms > T0_MS);

    shutdown.cancel();
    server.await.unwrap().unwrap();
}
