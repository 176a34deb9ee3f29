//! Symmetric consolidation of two comparable-rate streams.
//!
//! 1. merge both streams into one sorted, origin-tagged sequence
//! 2. cluster greedily: an entry joins the open cluster while it is less than
//!    `tolerance` from the cluster's *first* entry (so a cluster can span up to
//!    twice the tolerance between its other members)
//! 3. one axis point per cluster: the first surface timestamp in it, or else the
//!    median (the floor of the mean of the middle pair for even sizes)
//! 4. per axis point, take the nearest unused sample of each stream strictly
//!    within `tolerance`; exact hits win, ties go to the earlier sample
//! 5. single-stream points become rows only across a real gap (the other stream
//!    has not matched for more than `2 × tolerance`) or while a gap continues
//!    (the previous row was single-stream)

use super::{Sample, SurfaceStatus, UnifiedRow, sorted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    InWater,
    Surface,
}

/// Axis timestamps produced by steps 1-3.
pub fn axis(inwater: &[Sample], surface: &[Sample], tolerance_ms: i64) -> Vec<i64> {
    let mut merged: Vec<(i64, Origin)> = inwater
        .iter()
        .map(|s| (s.timestamp_ms, Origin::InWater))
        .chain(surface.iter().map(|s| (s.timestamp_ms, Origin::Surface)))
        .collect();
    merged.sort_by_key(|&(t, _)| t);

    let mut points = Vec::new();
    let mut cluster: Vec<(i64, Origin)> = Vec::new();
    for entry in merged {
        if let Some(&(first, _)) = cluster.first() {
            if entry.0 - first >= tolerance_ms {
                points.push(representative(&cluster));
                cluster.clear();
            }
        }
        cluster.push(entry);
    }
    if !cluster.is_empty() {
        points.push(representative(&cluster));
    }
    points
}

/// Axis timestamp of a cluster: its first surface entry, else the median entry.
/// Even-sized clusters take the midpoint of the middle pair, floored to the
/// millisecond (toward negative infinity).
fn representative(cluster: &[(i64, Origin)]) -> i64 {
    if let Some(&(t, _)) = cluster.iter().find(|(_, o)| *o == Origin::Surface) {
        return t;
    }
    // Sorted on entry.
    let n = cluster.len();
    if n % 2 == 1 {
        cluster[n / 2].0
    } else {
        (cluster[n / 2 - 1].0 + cluster[n / 2].0).div_euclid(2)
    }
}

/// One stream's samples, sorted, with a used flag per sample.
struct Pool {
    samples: Vec<Sample>,
    used: Vec<bool>,
}

impl Pool {
    fn new(samples: &[Sample]) -> Self {
        let samples = sorted(samples);
        let used = vec![false; samples.len()];
        Self { samples, used }
    }

    /// Claims the nearest unused sample with `|t - at| < tolerance`.
    fn take_nearest(&mut self, at: i64, tolerance_ms: i64) -> Option<Sample> {
        let lo = self.samples.partition_point(|s| s.timestamp_ms <= at - tolerance_ms);
        let hi = self.samples.partition_point(|s| s.timestamp_ms < at + tolerance_ms);

        let best = (lo..hi)
            .filter(|&i| !self.used[i])
            .min_by_key(|&i| {
                let t = self.samples[i].timestamp_ms;
                ((t - at).abs(), t)
            })?;
        self.used[best] = true;
        Some(self.samples[best])
    }
}

pub fn fuse(inwater: &[Sample], surface: &[Sample], tolerance_ms: i64) -> Vec<UnifiedRow> {
    let points = axis(inwater, surface, tolerance_ms);
    let mut uw_pool = Pool::new(inwater);
    let mut sf_pool = Pool::new(surface);

    let gap = 2 * tolerance_ms;
    let mut last_uw: Option<i64> = None;
    let mut last_sf: Option<i64> = None;
    let mut prev_single = false;
    let mut rows = Vec::with_capacity(points.len());

    for at in points {
        let uw = uw_pool.take_nearest(at, tolerance_ms);
        let sf = sf_pool.take_nearest(at, tolerance_ms);

        let emit = match (uw.is_some(), sf.is_some()) {
            (true, true) => true,
            (false, false) => false,
            (true, false) => prev_single || last_sf.is_none_or(|t| at - t > gap),
            (false, true) => prev_single || last_uw.is_none_or(|t| at - t > gap),
        };
        if !emit {
            continue;
        }

        if uw.is_some() {
            last_uw = Some(at);
        }
        if sf.is_some() {
            last_sf = Some(at);
        }
        prev_single = uw.is_none() || sf.is_none();

        rows.push(UnifiedRow {
            timestamp: at,
            inwater_value: uw.map(|s| s.value),
            surface_value: sf.map(|s| s.value),
            surface_timestamp_used: sf.map(|s| s.timestamp_ms),
            surface_age_ms: sf.map(|s| at - s.timestamp_ms),
            surface_status: if sf.is_some() {
                SurfaceStatus::Fresh
            } else {
                SurfaceStatus::Missing
            },
        });
    }
    rows
}
