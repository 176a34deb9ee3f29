//! Manifest persistence.
//!
//! Read-modify-atomic-write only: callers clone the in-memory manifest, apply the
//! change, [`save`] it, and only then adopt the new value.

use std::{fs, io, path::Path};

use sensor_ingest::models::manifest::Manifest;

use crate::store::{StoreError, durable::write_atomic};

/// File name of the manifest inside a session directory.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Loads and validates the manifest in `dir`.
///
/// Returns `Ok(None)` when there is no manifest, and a consistency error when it
/// does not parse or violates its invariants.
pub fn load(dir: &Path) -> Result<Option<Manifest>, StoreError> {
    let path = dir.join(MANIFEST_NAME);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(&path, e)),
    };
    let manifest: Manifest = serde_json::from_slice(&bytes).map_err(|e| StoreError::Consistency {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    manifest.validate().map_err(|e| StoreError::Consistency {
        path,
        reason: e.to_string(),
    })?;
    Ok(Some(manifest))
}

/// Atomically replaces the manifest in `dir`.
pub fn save(dir: &Path, manifest: &Manifest) -> Result<(), StoreError> {
    let path = dir.join(MANIFEST_NAME);
    let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| StoreError::Consistency {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))
}
