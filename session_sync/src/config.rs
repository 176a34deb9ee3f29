//! Node configuration: parsing, normalization, and loading.
//!
//! One TOML file configures both roles of a node (producer server and surface
//! puller). Every section and field has a default, so an empty file is valid.
//!
//! Key behaviors:
//! - Out-of-range values that have an obvious nearest legal value are clamped and
//!   counted in a [`NormalizationReport`] (chunk interval, clock round trips).
//! - Contradictory values are errors (fresh threshold above the staleness threshold,
//!   zero tolerance, an endpoint that is not an http(s) URL).
//! - `SESSION_SYNC_ROOT`, `SESSION_SYNC_ENDPOINT` and `SESSION_SYNC_BANDWIDTH_CAP`
//!   override the file.
//!
//! Entrypoints:
//! - Parse + normalize from a TOML string: [`load_config_str`]
//! - Parse + normalize from a file path: [`load_config_path`]
//! - Normalization of an already-parsed value: [`normalize_config`]

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use shared_utils::env::{get_env_opt, get_env_parsed};
use toml::from_str;

use crate::fusion::{FusionParams, Strategy};

/// Overrides `storage.root`.
pub const ROOT_ENV: &str = "SESSION_SYNC_ROOT";
/// Overrides `replication.endpoint`.
pub const ENDPOINT_ENV: &str = "SESSION_SYNC_ENDPOINT";
/// Overrides `replication.bandwidth_cap_bytes_per_sec`.
pub const BANDWIDTH_CAP_ENV: &str = "SESSION_SYNC_BANDWIDTH_CAP";

/// Legal range for `storage.chunk_interval_s`.
pub const CHUNK_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 15..=300;
/// Legal range for `clock.round_trips`.
pub const ROUND_TRIP_RANGE: std::ops::RangeInclusive<usize> = 1..=64;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageCfg,
    pub replication: ReplicationCfg,
    pub clock: ClockCfg,
    pub fusion: FusionCfg,
    pub server: ServerCfg,
}

/// Chunk store settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageCfg {
    /// Mission directories live under this root.
    pub root: PathBuf,
    /// Time-based flush interval, clamped into 15..=300 seconds.
    pub chunk_interval_s: u64,
    /// Buffer size that forces a roll, in bytes.
    pub max_chunk_bytes: u64,
    /// Bytes the store may occupy; 0 means unlimited.
    pub storage_quota_bytes: u64,
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            chunk_interval_s: 60,
            max_chunk_bytes: 5 * 1024 * 1024,
            storage_quota_bytes: 0,
        }
    }
}

/// Puller settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationCfg {
    /// Base URL of the remote producer.
    pub endpoint: String,
    /// Delay between sync passes.
    pub poll_interval_ms: u64,
    /// Download cap; 0 disables throttling.
    pub bandwidth_cap_bytes_per_sec: u64,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
}

impl Default for ReplicationCfg {
    fn default() -> Self {
        Self {
            endpoint: "http://192.168.2.2:8080".to_string(),
            poll_interval_ms: 15_000,
            bandwidth_cap_bytes_per_sec: 512_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ReplicationCfg {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockCfg {
    /// Round trips per offset measurement.
    pub round_trips: usize,
}

impl Default for ClockCfg {
    fn default() -> Self {
        Self { round_trips: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FusionCfg {
    pub strategy: Strategy,
    pub tolerance_ms: i64,
    pub fresh_threshold_ms: i64,
    pub staleness_threshold_ms: i64,
}

impl Default for FusionCfg {
    fn default() -> Self {
        let p = FusionParams::default();
        Self {
            strategy: Strategy::default(),
            tolerance_ms: p.tolerance_ms,
            fresh_threshold_ms: p.fresh_threshold_ms,
            staleness_threshold_ms: p.staleness_threshold_ms,
        }
    }
}

impl FusionCfg {
    pub fn params(&self) -> FusionParams {
        FusionParams {
            tolerance_ms: self.tolerance_ms,
            fresh_threshold_ms: self.fresh_threshold_ms,
            staleness_threshold_ms: self.staleness_threshold_ms,
        }
    }
}

/// Producer HTTP server settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerCfg {
    pub bind: SocketAddr,
    /// Request quota; requests beyond it get 429.
    pub requests_per_second: u32,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            requests_per_second: 50,
        }
    }
}

/// Summary of changes performed during normalization.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NormalizationReport {
    /// `storage.chunk_interval_s` was outside 15..=300.
    pub chunk_interval_clamped: bool,
    /// `clock.round_trips` was outside 1..=64.
    pub round_trips_clamped: bool,
    /// `server.requests_per_second` was 0 and raised to 1.
    pub requests_per_second_raised: bool,
    /// Environment variables that replaced file values.
    pub env_overrides: Vec<&'static str>,
}

impl NormalizationReport {
    pub fn is_clean(&self) -> bool {
        !self.chunk_interval_clamped
            && !self.round_trips_clamped
            && !self.requests_per_second_raised
    }
}

/// Applies environment overrides, clamps, and validates `cfg` in place.
///
/// Errors:
/// - `SESSION_SYNC_BANDWIDTH_CAP` set but not an integer
/// - `replication.endpoint` not an http(s) URL
/// - `fusion.tolerance_ms <= 0`, negative thresholds, or
///   `fusion.fresh_threshold_ms > fusion.staleness_threshold_ms`
/// - `storage.max_chunk_bytes == 0`
pub fn normalize_config(cfg: &mut Config) -> anyhow::Result<NormalizationReport> {
    let mut report = NormalizationReport::default();

    if let Some(root) = get_env_opt(ROOT_ENV) {
        cfg.storage.root = PathBuf::from(root);
        report.env_overrides.push(ROOT_ENV);
    }
    if let Some(endpoint) = get_env_opt(ENDPOINT_ENV) {
        cfg.replication.endpoint = endpoint;
        report.env_overrides.push(ENDPOINT_ENV);
    }
    if let Some(cap) = get_env_parsed::<u64>(BANDWIDTH_CAP_ENV)? {
        cfg.replication.bandwidth_cap_bytes_per_sec = cap;
        report.env_overrides.push(BANDWIDTH_CAP_ENV);
    }

    let interval = cfg
        .storage
        .chunk_interval_s
        .clamp(*CHUNK_INTERVAL_RANGE.start(), *CHUNK_INTERVAL_RANGE.end());
    if interval != cfg.storage.chunk_interval_s {
        report.chunk_interval_clamped = true;
        cfg.storage.chunk_interval_s = interval;
    }

    let trips = cfg
        .clock
        .round_trips
        .clamp(*ROUND_TRIP_RANGE.start(), *ROUND_TRIP_RANGE.end());
    if trips != cfg.clock.round_trips {
        report.round_trips_clamped = true;
        cfg.clock.round_trips = trips;
    }

    if cfg.server.requests_per_second == 0 {
        report.requests_per_second_raised = true;
        cfg.server.requests_per_second = 1;
    }

    if cfg.storage.max_chunk_bytes == 0 {
        bail!("storage.max_chunk_bytes must be greater than zero");
    }

    cfg.replication.endpoint = cfg.replication.endpoint.trim().to_string();
    if !is_http_url(&cfg.replication.endpoint) {
        bail!(
            "replication.endpoint {:?} is not an http(s) URL",
            cfg.replication.endpoint
        );
    }
    if cfg.replication.poll_interval_ms == 0 {
        bail!("replication.poll_interval_ms must be greater than zero");
    }

    let f = &cfg.fusion;
    if f.tolerance_ms <= 0 {
        bail!("fusion.tolerance_ms must be positive, got {}", f.tolerance_ms);
    }
    if f.fresh_threshold_ms < 0 || f.staleness_threshold_ms < 0 {
        bail!("fusion thresholds must not be negative");
    }
    if f.fresh_threshold_ms > f.staleness_threshold_ms {
        bail!(
            "fusion.fresh_threshold_ms ({}) exceeds fusion.staleness_threshold_ms ({})",
            f.fresh_threshold_ms,
            f.staleness_threshold_ms
        );
    }

    Ok(report)
}

fn is_http_url(endpoint: &str) -> bool {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return false;
    };
    matches!(scheme, "http" | "https") && !rest.is_empty() && !rest.starts_with('/')
}

/// Parse and normalize a config from a TOML string.
pub fn load_config_str(toml_str: &str) -> anyhow::Result<Config> {
    let mut cfg: Config = from_str(toml_str).context("failed to parse config TOML")?;
    let report = normalize_config(&mut cfg).context("normalize_config failed")?;
    if !report.is_clean() {
        tracing::warn!(?report, "configuration values were adjusted");
    }
    Ok(cfg)
}

/// Read a config TOML file from disk, parse, and normalize it.
pub fn load_config_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config file {}", path.as_ref().display()))?;
    load_config_str(&text)
}
