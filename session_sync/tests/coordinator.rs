mod common;

use std::{sync::Arc, time::Duration};

use common::{Fixture, StoreNode, T0_MS, readings};
use sensor_ingest::{
    driver::{ReplayDriver, SensorDriver},
    models::{reading::SensorRole, session::SessionState},
    remote::RemoteNode,
};
use session_sync::{
    config::Config,
    coordinator::{CoordinatorError, SyncCoordinator},
    fusion::dataset::UNIFIED_NAME,
    replication::stats::PullState,
};
use tempfile::TempDir;

fn coordinator(node: Arc<StoreNode>, root: &TempDir) -> SyncCoordinator {
    let mut config = Config::default();
    config.storage.root = root.path().join("surface");
    config.replication.poll_interval_ms = 20;
    config.replication.bandwidth_cap_bytes_per_sec = 0;
    config.clock.round_trips = 3;
    let remote: Arc<dyn RemoteNode> = node;
    SyncCoordinator::new(config, "m1", remote)
}

fn surface_driver(n: usize) -> Box<dyn SensorDriver> {
    Box::new(ReplayDriver::new(readings("sf-01", T0_MS, n, 1000)))
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn mission_runs_from_start_to_fusion() {
    let producer = Fixture::new();
    let mut node = StoreNode::new(producer.store.clone());
    node.clock_skew_ms = 5_000;
    let node = Arc::new(node);
    let root = TempDir::new().unwrap();
    let coord = coordinator(node.clone(), &root);

    let surface = coord
        .start_recording_sensor(SensorRole::Surface, "sf-01", Some(surface_driver(20)))
        .await
        .unwrap();
    let inwater = coord
        .start_recording_sensor(SensorRole::InWater, "uw-01", None)
        .await
        .unwrap();

    producer
        .store
        .append_readings(&inwater.session_id, readings("uw-01", T0_MS + 5_250, 40, 500))
        .unwrap();
    producer.store.flush(&inwater.session_id).unwrap();

    coord.wait_for_clock().await;
    let meta = coord.metadata().unwrap().unwrap();
    let clock = meta.clock.clone().unwrap();
    assert!(clock.is_synchronized());
    assert!((4_900.0..5_100.0).contains(&clock.offset_ms), "offset {}", clock.offset_ms);
    assert!(meta.drift_model.is_some());

    assert!(matches!(coord.run_fusion().await, Err(CoordinatorError::NotReady(_))));

    wait_for("surface readings", || {
        let s = coord.store().status(&surface.session_id).unwrap();
        s.total_rows + s.buffered_rows == 20
    })
    .await;
    let stats = coord.get_stats().await;
    assert_eq!(stats.mission, "m1");
    assert!(stats.surface.is_some());
    assert_eq!(stats.inwater.unwrap().state, PullState::Syncing);

    let sf = coord.stop_recording_sensor(SensorRole::Surface).await.unwrap();
    assert_eq!(sf.total_rows, 20);
    // The drain after the remote stop rides out a flaky link.
    node.fail_snapshots(2);
    let uw = coord.stop_recording_sensor(SensorRole::InWater).await.unwrap();
    assert_eq!(uw.total_rows, 40);

    let status = coord.get_fusion_status().unwrap();
    assert!(status.ready, "waiting on {:?}", status.waiting_on);

    let record = coord.run_fusion().await.unwrap();
    assert_eq!(record.rows, 40);
    let text = std::fs::read_to_string(coord.mission_dir().join(UNIFIED_NAME)).unwrap();
    assert_eq!(text.lines().count(), 41);

    let meta = coord.metadata().unwrap().unwrap();
    assert_eq!(meta.sensor(SensorRole::InWater).unwrap().state, SessionState::Stopped);
    assert_eq!(meta.sensor(SensorRole::Surface).unwrap().total_rows, 20);
    assert_eq!(meta.fusion.unwrap().rows, 40);
    assert_eq!(coord.get_stats().await.inwater.unwrap().state, PullState::Finalized);
}

#[tokio::test]
async fn roles_cannot_be_started_twice() {
    let producer = Fixture::new();
    let root = TempDir::new().unwrap();
    let coord = coordinator(Arc::new(StoreNode::new(producer.store.clone())), &root);

    assert!(matches!(
        coord.start_recording_sensor(SensorRole::Surface, "sf-01", None).await,
        Err(CoordinatorError::MissingDriver)
    ));
    coord
        .start_recording_sensor(SensorRole::Surface, "sf-01", Some(surface_driver(3)))
        .await
        .unwrap();
    assert!(matches!(
        coord
            .start_recording_sensor(SensorRole::Surface, "sf-01", Some(surface_driver(3)))
            .await,
        Err(CoordinatorError::AlreadyRecording(SensorRole::Surface))
    ));

    coord.start_recording_sensor(SensorRole::InWater, "uw-01", None).await.unwrap();
    assert!(matches!(
        coord.start_recording_sensor(SensorRole::InWater, "uw-01", None).await,
        Err(CoordinatorError::AlreadyRecording(SensorRole::InWater))
    ));

    coord.stop_recording_sensor(SensorRole::InWater).await.unwrap();
    assert!(matches!(
        coord.stop_recording_sensor(SensorRole::InWater).await,
        Err(CoordinatorError::NotRecording(SensorRole::InWater))
    ));
    coord.stop_recording_sensor(SensorRole::Surface).await.unwrap();
}
