//! In-water-driven alignment: the in-water timeline is the row timeline.

use super::{FusionParams, Sample, SurfaceStatus, UnifiedRow, sorted};

/// Exactly one row per in-water sample, in input order.
///
/// Each row carries the latest surface sample at or before it. The age decides
/// the status: fresh below `fresh_threshold_ms`, stale up to and including
/// `staleness_threshold_ms`, expired beyond that. Expired rows keep the surface
/// timestamp and age but drop the value.
pub fn fuse(inwater: &[Sample], surface: &[Sample], params: &FusionParams) -> Vec<UnifiedRow> {
    let surface = sorted(surface);

    inwater
        .iter()
        .map(|uw| {
            let t = uw.timestamp_ms;
            let held = surface.partition_point(|s| s.timestamp_ms <= t).checked_sub(1);
            let Some(s) = held.map(|i| surface[i]) else {
                return UnifiedRow {
                    timestamp: t,
                    inwater_value: Some(uw.value),
                    surface_value: None,
                    surface_timestamp_used: None,
                    surface_age_ms: None,
                    surface_status: SurfaceStatus::Missing,
                };
            };

            let age = t - s.timestamp_ms;
            let (status, value) = if age < params.fresh_threshold_ms {
                (SurfaceStatus::Fresh, Some(s.value))
            } else if age <= params.staleness_threshold_ms {
                (SurfaceStatus::Stale, Some(s.value))
            } else {
                (SurfaceStatus::Missing, None)
            };
            UnifiedRow {
                timestamp: t,
                inwater_value: Some(uw.value),
                surface_value: value,
                surface_timestamp_used: Some(s.timestamp_ms),
                surface_age_ms: Some(age),
                surface_status: status,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn params() -> FusionParams {
        FusionParams::default()
    }

    #[test]
    fn no_prior_surface_is_missing() {
        let rows = fuse(&[Sample::new(100, 1.0)], &[Sample::new(200, 2.0)], &params());
        assert_eq!(rows[0].surface_status, SurfaceStatus::Missing);
        assert_eq!(rows[0].surface_timestamp_used, None);
        assert_eq!(rows[0].surface_value, None);
    }

    #[test]
    fn holds_last_value_at_or_before() {
        let surface = [Sample::new(0, 1.0), Sample::new(500, 2.0), Sample::new(1000, 3.0)];
        let rows = fuse(&[Sample::new(500, 0.0), Sample::new(999, 0.0)], &surface, &params());
        assert_eq!(rows[0].surface_value, Some(2.0));
        assert_eq!(rows[0].surface_age_ms, Some(0));
        assert_eq!(rows[1].surface_value, Some(2.0));
        assert_eq!(rows[1].surface_age_ms, Some(499));
    }

    #[test]
    fn fresh_stale_expired_thresholds() {
        let surface = [Sample::new(0, 7.0)];
        let inwater = [
            Sample::new(9_999, 0.0),
            Sample::new(10_000, 0.0),
            Sample::new(30_000, 0.0),
            Sample::new(30_001, 0.0),
        ];
        let rows = fuse(&inwater, &surface, &params());
        let statuses: Vec<_> = rows.iter().map(|r| r.surface_status).collect();
        assert_eq!(
            statuses,
            vec![
                SurfaceStatus::Fresh,
                SurfaceStatus::Stale,
                SurfaceStatus::Stale,
                SurfaceStatus::Missing
            ]
        );
        assert_eq!(rows[2].surface_value, Some(7.0));
        assert_eq!(rows[3].surface_value, None);
        assert_eq!(rows[3].surface_timestamp_used, Some(0));
        assert_eq!(rows[3].surface_age_ms, Some(30_001));
    }

    #[test]
    fn unsorted_surface_input_is_handled() {
        let surface = [Sample::new(300, 3.0), Sample::new(100, 1.0)];
        let rows = fuse(&[Sample::new(200, 0.0)], &surface, &params());
        assert_eq!(rows[0].surface_timestamp_used, Some(100));
    }

    proptest! {
        #[test]
        fn one_row_per_inwater_reading(
            uw in prop::collection::vec(0i64..100_000, 0..200),
            sf in prop::collection::vec(0i64..100_000, 0..200),
        ) {
            let inwater: Vec<_> = uw.iter().map(|&t| Sample::new(t, 1.0)).collect();
            let surface: Vec<_> = sf.iter().map(|&t| Sample::new(t, 2.0)).collect();
            let rows = fuse(&inwater, &surface, &params());
            prop_assert_eq!(rows.len(), inwater.len());
            for (row, s) in rows.iter().zip(&inwater) {
                prop_assert_eq!(row.timestamp, s.timestamp_ms);
                if let Some(age) = row.surface_age_ms {
                    prop_assert!(age >= 0);
                }
            }
        }
    }
}
