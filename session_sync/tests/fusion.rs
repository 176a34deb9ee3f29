mod common;

use std::{fs, path::PathBuf};

use common::{Fixture, T0_MS, readings};
use proptest::prelude::*;
use sensor_ingest::{clock::DriftModel, models::session::SessionConfig};
use session_sync::{
    fusion::{
        FusionParams, Sample, Strategy, SurfaceStatus, fuse,
        dataset::{UNIFIED_HEADER, load_samples, write_unified_csv},
        symmetric,
    },
    store::chunk::FINAL_NAME,
};

fn at(offsets: &[i64], value: f64) -> Vec<Sample> {
    offsets.iter().map(|&t| Sample::new(T0_MS + t, value)).collect()
}

/// Records `n` readings every `step_ms` and stops, returning the session file.
fn recorded(fx: &Fixture, sensor_id: &str, start_ms: i64, n: usize, step_ms: i64) -> PathBuf {
    let id = fx
        .store
        .start_session(&SessionConfig::new("m1", sensor_id))
        .unwrap()
        .session_id;
    fx.store.append_readings(&id, readings(sensor_id, start_ms, n, step_ms)).unwrap();
    fx.store.stop_session(&id).unwrap();
    fx.store.session_dir(&id).unwrap().join(FINAL_NAME)
}

#[test]
fn consolidation_window_is_exclusive() {
    assert_eq!(symmetric::axis(&at(&[0, 24], 1.0), &[], 25), vec![T0_MS + 12]);
    assert_eq!(symmetric::axis(&at(&[0, 25], 1.0), &[], 25), vec![T0_MS, T0_MS + 25]);
}

#[test]
fn staleness_boundary_is_inclusive() {
    let params = FusionParams::default();
    let surface = at(&[0], 7.0);
    let rows = fuse(&at(&[30_000, 30_001], 1.0), &surface, None, Strategy::InWaterDriven, &params);

    assert_eq!(rows[0].surface_status, SurfaceStatus::Stale);
    assert_eq!(rows[0].surface_value, Some(7.0));
    assert_eq!(rows[1].surface_status, SurfaceStatus::Missing);
    assert_eq!(rows[1].surface_value, None);
    assert_eq!(rows[1].surface_age_ms, Some(30_001));
}

#[test]
fn interleaved_streams_fuse_symmetrically() {
    let params = FusionParams {
        tolerance_ms: 50,
        ..Default::default()
    };
    let rows = fuse(
        &at(&[0, 100, 200], 1.0),
        &at(&[50, 150], 2.0),
        None,
        Strategy::Symmetric,
        &params,
    );
    let shape: Vec<(i64, bool, bool)> = rows
        .iter()
        .map(|r| (r.timestamp - T0_MS, r.inwater_value.is_some(), r.surface_value.is_some()))
        .collect();
    assert_eq!(
        shape,
        vec![
            (0, true, false),
            (50, false, true),
            (100, true, false),
            (150, false, true),
            (200, true, false),
        ]
    );
}

#[test]
fn near_simultaneous_samples_share_a_row() {
    let rows = fuse(
        &at(&[0, 1000, 2010], 1.0),
        &at(&[5, 1000, 2000], 2.0),
        None,
        Strategy::Symmetric,
        &FusionParams::default(),
    );
    assert_eq!(rows.len(), 3);
    let times: Vec<i64> = rows.iter().map(|r| r.timestamp - T0_MS).collect();
    assert_eq!(times, vec![5, 1000, 2000]);
    assert!(rows.iter().all(|r| r.inwater_value.is_some() && r.surface_value.is_some()));
}

#[test]
fn recorded_sessions_fuse_into_unified_csv() {
    let fx = Fixture::new();
    let surface = recorded(&fx, "sf-01", T0_MS, 10, 1000);
    let inwater = recorded(&fx, "uw-01", T0_MS + 250, 20, 500);

    let uw = load_samples(&inwater).unwrap();
    let sf = load_samples(&surface).unwrap();
    assert_eq!((uw.len(), sf.len()), (20, 10));

    let rows = fuse(&uw, &sf, None, Strategy::InWaterDriven, &FusionParams::default());
    assert_eq!(rows.len(), 20);
    assert!(rows.iter().all(|r| r.surface_status == SurfaceStatus::Fresh));
    assert_eq!(rows[0].surface_age_ms, Some(250));
    assert_eq!(rows[1].surface_age_ms, Some(750));

    let mission_dir = fx.store.root().join("m1");
    let path = write_unified_csv(&mission_dir, &rows).unwrap();
    let text = fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some(UNIFIED_HEADER));
    assert_eq!(lines.count(), 20);
}

#[test]
fn drift_shifts_inwater_onto_surface_clock() {
    let drift = DriftModel::Constant {
        start_offset_ms: 1000.0,
    };
    let rows = fuse(
        &at(&[1000, 2000], 1.0),
        &at(&[0, 1000], 2.0),
        Some(&drift),
        Strategy::Symmetric,
        &FusionParams::default(),
    );
    let times: Vec<i64> = rows.iter().map(|r| r.timestamp - T0_MS).collect();
    assert_eq!(times, vec![0, 1000]);
    assert!(rows.iter().all(|r| r.surface_age_ms == Some(0)));
}

proptest! {
    #[test]
    fn inwater_driven_rows_match_inwater_count(
        uw in prop::collection::vec(0i64..100_000, 0..60),
        sf in prop::collection::vec(0i64..100_000, 0..60),
    ) {
        let rows = fuse(&at(&uw, 1.0), &at(&sf, 2.0), None, Strategy::InWaterDriven, &FusionParams::default());
        prop_assert_eq!(rows.len(), uw.len());
        for (row, t) in rows.iter().zip(&uw) {
            prop_assert_eq!(row.timestamp, T0_MS + t);
        }
    }

    #[test]
    fn symmetric_rows_never_exceed_input(
        uw in prop::collection::vec(0i64..10_000, 0..40),
        sf in prop::collection::vec(0i64..10_000, 0..40),
    ) {
        let rows = fuse(&at(&uw, 1.0), &at(&sf, 2.0), None, Strategy::Symmetric, &FusionParams::default());
        let used_uw = rows.iter().filter(|r| r.inwater_value.is_some()).count();
        let used_sf = rows.iter().filter(|r| r.surface_value.is_some()).count();
        prop_assert!(used_uw <= uw.len());
        prop_assert!(used_sf <= sf.len());
        prop_assert!(rows.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
