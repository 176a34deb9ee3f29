//! Canonical in-memory representation of one sensor sample.
//!
//! Both the underwater instrument and the surface reference instrument produce
//! [`Reading`]s; the device driver collaborator emits them and the recorder or
//! remote producer persists them unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped sample from one instrument.
///
/// Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Acquisition time (UTC), correlated with the producer's monotonic clock.
    pub timestamp: DateTime<Utc>,

    /// Instrument identifier (e.g., "ctd-uw-01").
    pub sensor_id: String,

    /// Instrument mode the sample was taken in (e.g., "continuous").
    pub mode: String,

    /// Primary measured value.
    pub value: f64,

    /// Water or housing temperature. Not all instruments supply this.
    pub temperature: Option<f64>,

    /// Supply voltage at sample time. Not all instruments supply this.
    pub supply_voltage: Option<f64>,
}

impl Reading {
    /// Builds a reading with only the mandatory fields set.
    pub fn new(
        timestamp: DateTime<Utc>,
        sensor_id: impl Into<String>,
        mode: impl Into<String>,
        value: f64,
    ) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            mode: mode.into(),
            value,
            temperature: None,
            supply_voltage: None,
        }
    }

    /// Acquisition time as epoch milliseconds.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// Which side of the paired recording an instrument sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    /// Underwater instrument on the remote node.
    InWater,
    /// Surface reference instrument on the local node.
    Surface,
}

impl std::fmt::Display for SensorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorRole::InWater => f.write_str("in_water"),
            SensorRole::Surface => f.write_str("surface"),
        }
    }
}
