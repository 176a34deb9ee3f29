//! Clock-offset estimation between the remote producer and the local node.
//!
//! A measurement performs a bounded number of round trips against the remote
//! time endpoint. For each one we record the local send time, the remote-reported
//! time and the local receive time. The sample with the shortest round trip wins:
//!
//! ```text
//! offset      = remote - (local_send + local_recv) / 2
//! uncertainty = (local_recv - local_send) / 2
//! ```
//!
//! Measuring never fails the caller. A measurement that cannot complete comes back
//! with `method = "none"` and the error captured in [`OffsetMeasurement::error`], so
//! recording proceeds unsynchronized.
//!
//! The [`DriftModel`] is how fusion consumes the estimate; building a linear model is
//! left to the caller, but [`DriftModel::correct`] defines how either kind is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::RemoteNode;

/// Upper bound on round trips per measurement.
pub const MAX_ROUND_TRIPS: usize = 64;

/// Timing of one request/response exchange, all in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundTrip {
    /// Local clock when the request was sent.
    pub local_send_ms: f64,
    /// Remote clock as reported in the response.
    pub remote_ms: f64,
    /// Local clock when the response arrived.
    pub local_recv_ms: f64,
}

impl RoundTrip {
    /// Round-trip time.
    pub fn rtt_ms(&self) -> f64 {
        self.local_recv_ms - self.local_send_ms
    }

    /// Remote time minus the midpoint of the local window.
    pub fn offset_ms(&self) -> f64 {
        self.remote_ms - (self.local_send_ms + self.local_recv_ms) / 2.0
    }
}

/// Result of a clock measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetMeasurement {
    /// `"round_trip"` when an estimate exists, `"none"` otherwise.
    pub method: String,
    /// Remote clock minus local clock, in milliseconds.
    pub offset_ms: f64,
    /// Half the best round trip, in milliseconds.
    pub uncertainty_ms: f64,
    /// When the measurement finished.
    pub measured_at: DateTime<Utc>,
    /// Round trips that completed.
    pub samples: usize,
    /// Why the measurement could not complete.
    pub error: Option<String>,
}

impl OffsetMeasurement {
    /// A failed measurement with the reason captured as data.
    pub fn failed(error: impl Into<String>, measured_at: DateTime<Utc>) -> Self {
        Self {
            method: "none".to_string(),
            offset_ms: 0.0,
            uncertainty_ms: 0.0,
            measured_at,
            samples: 0,
            error: Some(error.into()),
        }
    }

    /// True when an offset estimate is available.
    pub fn is_synchronized(&self) -> bool {
        self.error.is_none() && self.samples > 0
    }
}

/// Picks the lowest-latency sample and returns `(offset_ms, uncertainty_ms)`.
///
/// Samples with a negative round trip (local clock stepped mid-exchange) are ignored.
pub fn estimate(samples: &[RoundTrip]) -> Option<(f64, f64)> {
    samples
        .iter()
        .filter(|s| s.rtt_ms() >= 0.0)
        .min_by(|a, b| a.rtt_ms().total_cmp(&b.rtt_ms()))
        .map(|best| (best.offset_ms(), best.rtt_ms() / 2.0))
}

fn now_ms() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1000.0
}

/// Measures the offset between `remote`'s clock and the local clock.
///
/// `round_trips` is clamped to `1..=MAX_ROUND_TRIPS`. Individual failed round trips
/// are skipped; the measurement only fails when none completes.
pub async fn measure_offset(remote: &dyn RemoteNode, round_trips: usize) -> OffsetMeasurement {
    let round_trips = round_trips.clamp(1, MAX_ROUND_TRIPS);
    let mut samples = Vec::with_capacity(round_trips);
    let mut last_error = None;

    for attempt in 0..round_trips {
        let local_send_ms = now_ms();
        match remote.server_time().await {
            Ok(t) => samples.push(RoundTrip {
                local_send_ms,
                remote_ms: t.server_time_ms as f64,
                local_recv_ms: now_ms(),
            }),
            Err(e) => {
                tracing::debug!(attempt, error = %e, "clock round trip failed");
                last_error = Some(e.to_string());
            }
        }
    }

    let measured_at = Utc::now();
    match estimate(&samples) {
        Some((offset_ms, uncertainty_ms)) => {
            tracing::info!(offset_ms, uncertainty_ms, samples = samples.len(), "clock offset measured");
            OffsetMeasurement {
                method: "round_trip".to_string(),
                offset_ms,
                uncertainty_ms,
                measured_at,
                samples: samples.len(),
                error: None,
            }
        }
        None => {
            let reason = last_error.unwrap_or_else(|| "no usable round trips".to_string());
            tracing::warn!(error = %reason, "clock offset measurement failed; continuing unsynchronized");
            OffsetMeasurement::failed(reason, measured_at)
        }
    }
}

/// Mapping from the in-water clock to the surface clock.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriftModel {
    /// Fixed offset: `corrected = t - offset`.
    Constant {
        /// Remote minus local, ms.
        #[serde(rename = "startOffsetMs", alias = "offset_ms")]
        start_offset_ms: f64,
    },
    /// Offset that grows linearly from `reference_time`:
    /// `corrected = t - (start_offset + drift_rate * (t - reference_time))`.
    Linear {
        /// Offset at `reference_time`, ms.
        #[serde(rename = "startOffsetMs")]
        start_offset_ms: f64,
        /// Offset change per elapsed millisecond.
        #[serde(rename = "driftRatePerMs")]
        drift_rate_per_ms: f64,
        /// Epoch ms the start offset was measured at.
        #[serde(rename = "referenceTime")]
        reference_time_ms: i64,
    },
}

impl DriftModel {
    /// Constant model from a successful measurement.
    pub fn from_measurement(m: &OffsetMeasurement) -> Option<Self> {
        m.is_synchronized().then_some(DriftModel::Constant {
            start_offset_ms: m.offset_ms,
        })
    }

    /// Maps a raw in-water timestamp (epoch ms) onto the surface clock.
    pub fn correct(&self, t_ms: i64) -> i64 {
        let offset = match *self {
            DriftModel::Constant { start_offset_ms } => start_offset_ms,
            DriftModel::Linear {
                start_offset_ms,
                drift_rate_per_ms,
                reference_time_ms,
            } => start_offset_ms + drift_rate_per_ms * (t_ms - reference_time_ms) as f64,
        };
        t_ms - offset.round() as i64
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::api::{SessionStatus, Snapshot, TimeResponse};
    use crate::models::session::{FinalSummary, Session, SessionConfig};
    use crate::remote::{ByteStream, RemoteError};

    use super::*;

    #[test]
    fn best_sample_is_lowest_latency() {
        let samples = [
            RoundTrip { local_send_ms: 0.0, remote_ms: 580.0, local_recv_ms: 100.0 },
            RoundTrip { local_send_ms: 200.0, remote_ms: 710.0, local_recv_ms: 220.0 },
            RoundTrip { local_send_ms: 300.0, remote_ms: 900.0, local_recv_ms: 340.0 },
        ];
        let (offset, uncertainty) = estimate(&samples).unwrap();
        assert_eq!(offset, 500.0);
        assert_eq!(uncertainty, 10.0);
    }

    #[test]
    fn negative_round_trips_are_ignored() {
        let samples = [RoundTrip { local_send_ms: 10.0, remote_ms: 0.0, local_recv_ms: 5.0 }];
        assert_eq!(estimate(&samples), None);
    }

    #[test]
    fn drift_models_apply_as_documented() {
        let c = DriftModel::Constant { start_offset_ms: 1500.0 };
        assert_eq!(c.correct(10_000), 8_500);

        let l = DriftModel::Linear {
            start_offset_ms: 100.0,
            drift_rate_per_ms: 0.001,
            reference_time_ms: 0,
        };
        // offset at t=60_000 is 100 + 60 = 160
        assert_eq!(l.correct(60_000), 59_840);
    }

    #[test]
    fn drift_model_json_shape() {
        let l: DriftModel = serde_json::from_str(
            r#"{"type":"linear","startOffsetMs":12.0,"driftRatePerMs":0.5,"referenceTime":1000}"#,
        )
        .unwrap();
        assert_eq!(l.correct(1000), 988);
        let c: DriftModel = serde_json::from_str(r#"{"type":"constant","startOffsetMs":-3.0}"#).unwrap();
        assert_eq!(c.correct(0), 3);
    }

    proptest! {
        #[test]
        fn symmetric_delay_recovers_offset(
            offset in -100_000.0f64..100_000.0,
            one_way in 0.0f64..500.0,
            start in 0.0f64..1.0e9,
        ) {
            let s = RoundTrip {
                local_send_ms: start,
                remote_ms: start + one_way + offset,
                local_recv_ms: start + 2.0 * one_way,
            };
            let (est, unc) = estimate(&[s]).unwrap();
            prop_assert!((est - offset).abs() < 1e-6);
            prop_assert!((unc - one_way).abs() < 1e-6);
        }
    }

    struct FlakyClock {
        calls: AtomicUsize,
        fail_all: bool,
        offset_ms: i64,
    }

    #[async_trait]
    impl RemoteNode for FlakyClock {
        async fn snapshot(&self, _: &str, _: u64) -> Result<Snapshot, RemoteError> {
            Err(RemoteError::Decode("unused".into()))
        }
        async fn fetch_file(&self, _: &str, _: &str) -> Result<ByteStream, RemoteError> {
            Err(RemoteError::Decode("unused".into()))
        }
        async fn session_status(&self, _: &str) -> Result<SessionStatus, RemoteError> {
            Err(RemoteError::Decode("unused".into()))
        }
        async fn start_session(&self, _: &SessionConfig) -> Result<Session, RemoteError> {
            Err(RemoteError::Decode("unused".into()))
        }
        async fn stop_session(&self, _: &str) -> Result<FinalSummary, RemoteError> {
            Err(RemoteError::Decode("unused".into()))
        }
        async fn server_time(&self) -> Result<TimeResponse, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all || n % 2 == 0 {
                return Err(RemoteError::Status { status: 503, body: "busy".into() });
            }
            Ok(TimeResponse {
                server_time_ms: Utc::now().timestamp_millis() + self.offset_ms,
            })
        }
    }

    #[tokio::test]
    async fn measurement_skips_failed_round_trips() {
        let node = FlakyClock { calls: AtomicUsize::new(0), fail_all: false, offset_ms: 2_000 };
        let m = measure_offset(&node, 6).await;
        assert!(m.is_synchronized());
        assert_eq!(m.samples, 3);
        assert_eq!(m.method, "round_trip");
        // Remote ms are truncated integers and the exchange is in-process.
        assert!((m.offset_ms - 2_000.0).abs() < 50.0, "offset {}", m.offset_ms);
    }

    #[tokio::test]
    async fn measurement_failure_is_data_not_error() {
        let node = FlakyClock { calls: AtomicUsize::new(0), fail_all: true, offset_ms: 0 };
        let m = measure_offset(&node, 100).await;
        assert!(!m.is_synchronized());
        assert_eq!(m.method, "none");
        assert_eq!(node.calls.load(Ordering::SeqCst), MAX_ROUND_TRIPS);
        assert!(DriftModel::from_measurement(&m).is_none());
        assert!(m.error.unwrap().contains("503"));
    }
}
