//! Mirror-side writes: verified chunk downloads and finalization.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use sensor_ingest::{
    models::manifest::{ChunkEntry, FinalFile, Manifest},
    remote::RemoteNode,
};
use sha2::{Digest, Sha256};

use crate::{
    replication::{PullError, read::read_current, throttle::BandwidthLimiter},
    store::{self, StoreError, chunk, durable::write_atomic, manifest},
};

/// How the mirror obtained its `session.csv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeSource {
    /// Concatenated from the mirrored chunks.
    Chunks,
    /// Downloaded from the remote.
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub source: FinalizeSource,
    /// Network bytes spent on the final file (0 when built from chunks).
    pub downloaded_bytes: u64,
    pub chunks_removed: usize,
}

/// Streams one remote file and checks size and SHA-256.
///
/// The whole `expected_size` is taken from the limiter before the request goes out,
/// so no byte arrives ahead of its budget.
pub async fn fetch_verified(
    remote: &dyn RemoteNode,
    limiter: &BandwidthLimiter,
    session_id: &str,
    name: &str,
    expected_size: u64,
    expected_sha256: &str,
) -> Result<Vec<u8>, PullError> {
    limiter.acquire(expected_size).await;
    let mut stream = remote.fetch_file(session_id, name).await?;
    let mut buf = Vec::with_capacity(expected_size as usize);
    let mut hasher = Sha256::new();

    while let Some(frame) = stream.next().await {
        let frame = frame?;
        hasher.update(&frame);
        buf.extend_from_slice(&frame);
        if buf.len() as u64 > expected_size {
            return Err(PullError::SizeMismatch {
                name: name.to_string(),
                expected: expected_size,
                actual: buf.len() as u64,
            });
        }
    }

    if buf.len() as u64 != expected_size {
        return Err(PullError::SizeMismatch {
            name: name.to_string(),
            expected: expected_size,
            actual: buf.len() as u64,
        });
    }
    let actual = hex::encode(hasher.finalize());
    if actual != expected_sha256 {
        return Err(PullError::Integrity {
            name: name.to_string(),
            expected: expected_sha256.to_string(),
            actual,
        });
    }
    Ok(buf)
}

/// Downloads one chunk into `dir`. Nothing lands on disk unless it verified.
pub async fn download_chunk(
    remote: &dyn RemoteNode,
    limiter: &BandwidthLimiter,
    session_id: &str,
    entry: &ChunkEntry,
    dir: &Path,
) -> Result<u64, PullError> {
    let bytes = fetch_verified(remote, limiter, session_id, &entry.name, entry.size, &entry.sha256).await?;
    let len = bytes.len() as u64;
    write_file(dir.join(&entry.name), bytes).await?;
    tracing::debug!(session_id, chunk = %entry.name, bytes = len, "chunk mirrored");
    Ok(len)
}

async fn write_file(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
    store::blocking(move || {
        if let Some(parent) = path.parent() {
            store::durable::ensure_dir(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))
    })
    .await
}

/// Makes the mirror final: `session.csv` identical to the remote's, the stopped
/// manifest next to it, and no chunk files left.
///
/// `full` must be the unfiltered remote manifest. The local chunks are used when
/// they are complete and consolidate to the advertised hash; otherwise the final
/// file is downloaded.
pub async fn finalize(
    remote: &dyn RemoteNode,
    limiter: &BandwidthLimiter,
    session_id: &str,
    dir: &Path,
    full: Manifest,
    final_file: &FinalFile,
) -> Result<Finalized, PullError> {
    let local = {
        let dir = dir.to_path_buf();
        let full = full.clone();
        let expected = final_file.sha256.clone();
        store::blocking(move || consolidate_local(&dir, &full, &expected)).await?
    };

    let (bytes, source, downloaded_bytes) = match local {
        Some(bytes) => (bytes, FinalizeSource::Chunks, 0),
        None => {
            let bytes = fetch_verified(
                remote,
                limiter,
                session_id,
                &final_file.name,
                final_file.size,
                &final_file.sha256,
            )
            .await?;
            let n = bytes.len() as u64;
            (bytes, FinalizeSource::Download, n)
        }
    };

    let dir = dir.to_path_buf();
    let chunks_removed = store::blocking(move || {
        store::durable::ensure_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let path = dir.join(chunk::FINAL_NAME);
        write_atomic(&path, &bytes).map_err(|e| StoreError::io(&path, e))?;
        manifest::save(&dir, &full)?;
        chunk::remove_chunks(&dir, &full)
    })
    .await?;

    tracing::info!(session_id, ?source, downloaded_bytes, chunks_removed, "mirror finalized");
    Ok(Finalized {
        source,
        downloaded_bytes,
        chunks_removed,
    })
}

fn consolidate_local(dir: &Path, full: &Manifest, expected_sha: &str) -> Result<Option<Vec<u8>>, StoreError> {
    let Some(stopped_at) = full.stopped_at else {
        return Ok(None);
    };
    let current = read_current(dir).map_err(|e| StoreError::io(dir, e))?;
    let complete = full
        .chunks
        .iter()
        .all(|c| current.chunks.get(&c.index).is_some_and(|(_, size)| *size == c.size));
    if !complete {
        return Ok(None);
    }

    match chunk::consolidate(dir, full, stopped_at) {
        Ok((bytes, ff)) if ff.sha256 == expected_sha => Ok(Some(bytes)),
        Ok((_, ff)) => {
            tracing::warn!(
                dir = %dir.display(),
                expected = expected_sha,
                actual = %ff.sha256,
                "local consolidation differs from remote final file"
            );
            Ok(None)
        }
        Err(e @ StoreError::Capacity(_)) => Err(e),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "local chunks unusable for finalization");
            Ok(None)
        }
    }
}
