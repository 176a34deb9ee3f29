//! Error taxonomy shared by every component.
//!
//! Each component has its own `thiserror` enum; all of them map onto [`ErrorClass`],
//! which decides propagation: only `Capacity` and `Configuration` are session-fatal,
//! everything else is absorbed into the component's status record and retried.

use std::io;

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Storage exhausted. Halts the session; durable data stays intact.
    Capacity,
    /// Checksum or size mismatch. Discard and retry.
    Integrity,
    /// Timeout, unreachable host, transient HTTP status. Retry next pass.
    Connectivity,
    /// Unparsable or contradictory manifest. Rebuild from the directory listing.
    Consistency,
    /// Invalid settings. Fails the start call.
    Configuration,
    /// Unknown session or file.
    NotFound,
}

impl ErrorClass {
    /// True for classes that end the current session.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Capacity | ErrorClass::Configuration)
    }
}

/// True when `e` means the device has no room left.
pub fn is_storage_full(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::StorageFull
}
