//! Client side of the remote node's HTTP surface.
//!
//! This module defines the [`RemoteNode`] trait, the interface the replication
//! puller and the clock estimator use to talk to the underwater producer:
//!
//! - `GET /snapshots?session_id=&since_index=` → [`Snapshot`]
//! - `GET /files/{session}/{name}` → chunk or consolidated file bytes
//! - `POST /sessions` → [`Session`] (start)
//! - `POST /sessions/{id}/stop` → [`FinalSummary`]
//! - `GET /sessions/{id}` → [`SessionStatus`]
//! - `GET /time` → [`TimeResponse`]
//!
//! [`http_rest::HttpRemote`] is the production implementation. The trait is
//! object-safe so tests can substitute an in-memory node (`Arc<dyn RemoteNode>`).
pub mod errors;
pub mod http_rest;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::models::{
    api::{SessionStatus, Snapshot, TimeResponse},
    session::{FinalSummary, Session, SessionConfig},
};

pub use errors::RemoteError;

/// Body of a file download, yielded in network-sized frames.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RemoteError>> + Send>>;

#[async_trait]
pub trait RemoteNode: Send + Sync {
    /// Fetches the manifest, listing only chunks with `index > since_index`.
    async fn snapshot(&self, session_id: &str, since_index: u64) -> Result<Snapshot, RemoteError>;

    /// Streams the bytes of one file in the session directory.
    async fn fetch_file(&self, session_id: &str, name: &str) -> Result<ByteStream, RemoteError>;

    /// Reads the producer's session status.
    async fn session_status(&self, session_id: &str) -> Result<SessionStatus, RemoteError>;

    /// Reads the producer's wall clock.
    async fn server_time(&self) -> Result<TimeResponse, RemoteError>;

    /// Starts a recording session on the producer.
    async fn start_session(&self, config: &SessionConfig) -> Result<Session, RemoteError>;

    /// Stops a recording session; the producer consolidates it before answering.
    async fn stop_session(&self, session_id: &str) -> Result<FinalSummary, RemoteError>;
}
