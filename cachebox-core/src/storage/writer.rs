//! Backend-agnostic write stream.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::key::ArtifactKey;

use super::UploadSink;

/// Confirmation that the backend persisted an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: ArtifactKey,
    /// Number of bytes stored.
    pub size: u64,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub sha256: String,
}

/// Write stream for one artifact.
///
/// Chunks pass through a bounded channel to a single upload task that feeds
/// the backend's [`UploadSink`]. When the channel is full, [`write`] suspends
/// until the backend catches up. The upload task's result is the only
/// completion signal: [`finish`] resolves with it after the backend confirms.
///
/// Dropping a writer without calling [`finish`] aborts the upload.
///
/// [`write`]: ArtifactWriter::write
/// [`finish`]: ArtifactWriter::finish
pub struct ArtifactWriter {
    key: ArtifactKey,
    chunks: Option<mpsc::Sender<Bytes>>,
    commit: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<UploadReceipt>>>,
    bytes_written: u64,
}

impl ArtifactWriter {
    /// Starts the upload task for `sink`, buffering at most `capacity` chunks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(key: ArtifactKey, sink: Box<dyn UploadSink>, capacity: usize) -> Self {
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity.max(1));
        let (commit_tx, commit_rx) = oneshot::channel();
        let task = tokio::spawn(drive_upload(key.clone(), sink, chunk_rx, commit_rx));

        Self {
            key,
            chunks: Some(chunk_tx),
            commit: Some(commit_tx),
            task: Some(task),
            bytes_written: 0,
        }
    }

    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    /// Bytes accepted so far (not necessarily persisted yet).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Queues a chunk for upload, waiting while the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the upload has already failed.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let len = chunk.len() as u64;
        let sent = match &self.chunks {
            Some(chunks) => chunks.send(chunk).await.is_ok(),
            None => false,
        };
        if sent {
            self.bytes_written += len;
            return Ok(());
        }

        // The upload task stopped early; its result says why.
        self.chunks = None;
        self.commit = None;
        match self.settle().await {
            Err(e) => Err(e),
            Ok(_) => Err(Error::backend(
                self.key.as_str(),
                "upload settled before all data was written",
            )),
        }
    }

    /// Commits the upload and waits for the backend to confirm it.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the upload failed at any point.
    pub async fn finish(mut self) -> Result<UploadReceipt> {
        if let Some(commit) = self.commit.take() {
            let _ = commit.send(());
        }
        self.chunks = None;
        self.settle().await
    }

    /// Aborts the upload and waits until backend resources are released.
    pub async fn abort(mut self) {
        self.commit = None;
        self.chunks = None;
        let _ = self.settle().await;
    }

    async fn settle(&mut self) -> Result<UploadReceipt> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::backend(
                    self.key.as_str(),
                    format!("upload task failed: {}", e),
                )),
            },
            None => Err(Error::backend(self.key.as_str(), "upload already settled")),
        }
    }
}

impl std::fmt::Debug for ArtifactWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactWriter")
            .field("key", &self.key)
            .field("bytes_written", &self.bytes_written)
            .field("open", &self.chunks.is_some())
            .finish()
    }
}

async fn drive_upload(
    key: ArtifactKey,
    mut sink: Box<dyn UploadSink>,
    mut chunks: mpsc::Receiver<Bytes>,
    commit: oneshot::Receiver<()>,
) -> Result<UploadReceipt> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;

    while let Some(chunk) = chunks.recv().await {
        hasher.update(&chunk);
        size += chunk.len() as u64;
        if let Err(e) = sink.write(chunk).await {
            warn!(key = %key, error = %e, "upload failed while streaming");
            sink.abort().await;
            return Err(e);
        }
    }

    if commit.await.is_err() {
        debug!(key = %key, bytes = size, "upload dropped before commit, aborting");
        sink.abort().await;
        return Err(Error::backend(key.as_str(), "upload aborted before completion"));
    }

    sink.complete().await?;

    Ok(UploadReceipt {
        key,
        size,
        sha256: format!("{:x}", hasher.finalize()),
    })
}
