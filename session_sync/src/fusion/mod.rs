//! Fusion of the in-water and surface streams onto one timeline.
//!
//! Two strategies, both pure functions of their inputs:
//!
//! - [`Strategy::Symmetric`]: merge both streams, cluster near-coincident
//!   timestamps into axis points, match each stream to each axis point.
//! - [`Strategy::InWaterDriven`]: one row per in-water reading, with the latest
//!   surface reading at or before it attached (hold-last-value).
//!
//! In-water timestamps are mapped onto the surface clock with the drift model
//! before either strategy runs. All times are epoch milliseconds.
pub mod asymmetric;
pub mod dataset;
pub mod symmetric;

use sensor_ingest::{clock::DriftModel, models::reading::Reading};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    InWaterDriven,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionParams {
    /// Cluster width and match window (symmetric), strict.
    pub tolerance_ms: i64,
    /// Surface ages below this are fresh (in-water-driven).
    pub fresh_threshold_ms: i64,
    /// Surface ages above this are expired (in-water-driven).
    pub staleness_threshold_ms: i64,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            tolerance_ms: 25,
            fresh_threshold_ms: 10_000,
            staleness_threshold_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceStatus {
    Fresh,
    Stale,
    Missing,
}

impl SurfaceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SurfaceStatus::Fresh => "fresh",
            SurfaceStatus::Stale => "stale",
            SurfaceStatus::Missing => "missing",
        }
    }
}

/// One row of the fused dataset. Never mutated once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRow {
    pub timestamp: i64,
    pub inwater_value: Option<f64>,
    pub surface_value: Option<f64>,
    pub surface_timestamp_used: Option<i64>,
    pub surface_age_ms: Option<i64>,
    pub surface_status: SurfaceStatus,
}

/// A reading reduced to what fusion looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self { timestamp_ms, value }
    }
}

impl From<&Reading> for Sample {
    fn from(r: &Reading) -> Self {
        Self::new(r.timestamp_ms(), r.value)
    }
}

/// Applies the drift model to in-water samples and runs the chosen strategy.
pub fn fuse(
    inwater: &[Sample],
    surface: &[Sample],
    drift: Option<&DriftModel>,
    strategy: Strategy,
    params: &FusionParams,
) -> Vec<UnifiedRow> {
    let corrected: Vec<Sample> = inwater
        .iter()
        .map(|s| Sample::new(drift.map_or(s.timestamp_ms, |d| d.correct(s.timestamp_ms)), s.value))
        .collect();

    let rows = match strategy {
        Strategy::Symmetric => symmetric::fuse(&corrected, surface, params.tolerance_ms),
        Strategy::InWaterDriven => asymmetric::fuse(&corrected, surface, params),
    };
    tracing::debug!(
        ?strategy,
        inwater = inwater.len(),
        surface = surface.len(),
        rows = rows.len(),
        "streams fused"
    );
    rows
}

/// Stable sort by timestamp, keeping the caller's order for equal times.
pub(crate) fn sorted(samples: &[Sample]) -> Vec<Sample> {
    let mut out = samples.to_vec();
    out.sort_by_key(|s| s.timestamp_ms);
    out
}
