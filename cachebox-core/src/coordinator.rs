//! Cache coordinator: hit/miss decisions and per-key upload ownership.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, CacheOptions, ConflictPolicy};
use crate::error::{Error, Result};
use crate::key::ArtifactKey;
use crate::stats::{CacheStats, StatsSnapshot};
use crate::storage::{self, ArtifactWriter, ByteStream, StorageProvider, UploadReceipt};

/// Lifecycle of one key as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Unknown,
    Checking,
    Hit,
    Miss,
    Fetching,
    Uploading,
    Complete,
    Failed,
}

impl fmt::Display for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyState::Unknown => "unknown",
            KeyState::Checking => "checking",
            KeyState::Hit => "hit",
            KeyState::Miss => "miss",
            KeyState::Fetching => "fetching",
            KeyState::Uploading => "uploading",
            KeyState::Complete => "complete",
            KeyState::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn enter_state(key: &ArtifactKey, state: KeyState) {
    debug!(key = %key, state = %state, "cache state");
}

/// Outcome of a successful lookup.
pub enum Lookup {
    /// The artifact is stored; its bytes are served lazily by the stream.
    Hit(ByteStream),
    /// The backend confirmed the artifact is absent.
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_stream(self) -> Option<ByteStream> {
        match self {
            Lookup::Hit(stream) => Some(stream),
            Lookup::Miss => None,
        }
    }
}

impl fmt::Debug for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lookup::Hit(_) => f.write_str("Hit(..)"),
            Lookup::Miss => f.write_str("Miss"),
        }
    }
}

/// Tracks which keys have an upload in flight.
#[derive(Default)]
struct UploadRegistry {
    slots: DashMap<ArtifactKey, Arc<Mutex<()>>>,
    drained: Notify,
}

impl UploadRegistry {
    async fn acquire(
        self: &Arc<Self>,
        key: &ArtifactKey,
        policy: ConflictPolicy,
    ) -> Result<UploadSlot> {
        let lock = Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        // Built before waiting so a cancelled acquire still cleans up the entry
        let mut slot = UploadSlot {
            registry: Arc::clone(self),
            key: key.clone(),
            lock,
            guard: None,
        };

        let guard = match policy {
            ConflictPolicy::Reject => Arc::clone(&slot.lock)
                .try_lock_owned()
                .map_err(|_| Error::UploadInProgress {
                    key: key.to_string(),
                })?,
            ConflictPolicy::Wait => {
                debug!(key = %key, "waiting for upload slot");
                Arc::clone(&slot.lock).lock_owned().await
            }
        };
        slot.guard = Some(guard);
        Ok(slot)
    }

    fn is_busy(&self, key: &ArtifactKey) -> bool {
        self.slots.contains_key(key)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.slots.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Exclusive upload ownership for one key. Released on drop.
struct UploadSlot {
    registry: Arc<UploadRegistry>,
    key: ArtifactKey,
    lock: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UploadSlot {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map and this slot still reference the lock: nobody is queued
        self.registry
            .slots
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
        if self.registry.slots.is_empty() {
            self.registry.drained.notify_waiters();
        }
    }
}

/// One in-flight upload owned by the coordinator.
///
/// Write chunks with [`write`](UploadSession::write), then call
/// [`finish`](UploadSession::finish) to commit. Dropping the session without
/// finishing aborts the upload; the key's upload slot is released either way.
pub struct UploadSession {
    key: ArtifactKey,
    writer: Option<ArtifactWriter>,
    stats: Arc<CacheStats>,
    max_size: Option<u64>,
    written: u64,
    state: KeyState,
    _slot: UploadSlot,
}

impl UploadSession {
    pub fn key(&self) -> &ArtifactKey {
        &self.key
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Forwards a chunk to the backend, suspending while its buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ArtifactTooLarge`] once the size limit would be
    /// exceeded, or the backend's error if the upload failed. Either way the
    /// upload is aborted and the session cannot be used further.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if self.writer.is_none() {
            return Err(Error::backend(
                self.key.as_str(),
                "upload session is no longer writable",
            ));
        }

        let len = chunk.len() as u64;
        if let Some(limit) = self.max_size {
            if self.written + len > limit {
                if let Some(writer) = self.writer.take() {
                    writer.abort().await;
                }
                self.fail("artifact too large");
                return Err(Error::ArtifactTooLarge {
                    key: self.key.to_string(),
                    limit,
                });
            }
        }

        let result = match self.writer.as_mut() {
            Some(writer) => writer.write(chunk).await,
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.written += len;
                Ok(())
            }
            Err(e) => {
                self.writer = None;
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Commits the upload and waits for the backend to confirm it.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the artifact was not persisted.
    pub async fn finish(mut self) -> Result<UploadReceipt> {
        let writer = self.writer.take().ok_or_else(|| {
            Error::backend(self.key.as_str(), "upload session is no longer writable")
        })?;

        match writer.finish().await {
            Ok(receipt) => {
                self.state = KeyState::Complete;
                enter_state(&self.key, self.state);
                self.stats.record_upload(receipt.size);
                Ok(receipt)
            }
            Err(e) => {
                self.fail(&e.to_string());
                Err(e)
            }
        }
    }

    /// Discards the upload and waits until backend resources are released.
    ///
    /// An explicit abort is the caller's decision and is not counted as a
    /// failed upload.
    pub async fn abort(mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort().await;
            self.state = KeyState::Failed;
            debug!(key = %self.key, "upload aborted");
        }
    }

    fn fail(&mut self, reason: &str) {
        self.state = KeyState::Failed;
        self.stats.record_upload_failure();
        warn!(key = %self.key, bytes = self.written, reason, "upload failed");
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            debug!(key = %self.key, "upload session dropped before finish, aborting");
        }
    }
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("written", &self.written)
            .finish()
    }
}

/// Decides hits and misses and owns every upload to one storage provider.
///
/// The coordinator is cheap to share behind an `Arc`; all methods take `&self`.
/// Call [`shutdown`](CacheCoordinator::shutdown) once to end its lifecycle.
pub struct CacheCoordinator {
    provider: Arc<dyn StorageProvider>,
    options: CacheOptions,
    uploads: Arc<UploadRegistry>,
    stats: Arc<CacheStats>,
    closed: AtomicBool,
}

impl CacheCoordinator {
    pub fn new(provider: Arc<dyn StorageProvider>, options: CacheOptions) -> Self {
        Self {
            provider,
            options,
            uploads: Arc::new(UploadRegistry::default()),
            stats: Arc::new(CacheStats::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Builds the configured provider and a coordinator on top of it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let provider = storage::build_provider(config)?;
        info!(backend = provider.name(), "cache coordinator ready");
        Ok(Self::new(provider, config.cache.clone()))
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.provider
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true while an upload session for `key` is open or queued.
    pub fn is_uploading(&self, key: &ArtifactKey) -> bool {
        self.uploads.is_busy(key)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Looks up an artifact.
    ///
    /// # Arguments
    ///
    /// * `key` - The artifact key to look up
    ///
    /// # Returns
    ///
    /// Returns `Lookup::Hit` with a lazy byte stream if the backend confirms the
    /// artifact, `Lookup::Miss` if it confirms absence.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when presence could not be determined. A
    /// failed lookup is never reported as a miss.
    pub async fn lookup(&self, key: &ArtifactKey) -> Result<Lookup> {
        self.ensure_open()?;
        enter_state(key, KeyState::Checking);

        match self.provider.exists(key).await {
            Ok(true) => {
                self.stats.record_hit();
                enter_state(key, KeyState::Hit);
                let stream = self.provider.create_read_stream(key);
                enter_state(key, KeyState::Fetching);
                Ok(Lookup::Hit(self.track_fetch(key, stream)))
            }
            Ok(false) => {
                self.stats.record_miss();
                enter_state(key, KeyState::Miss);
                Ok(Lookup::Miss)
            }
            Err(e) => {
                self.stats.record_lookup_error();
                warn!(key = %key, backend = self.provider.name(), error = %e, "cache lookup failed");
                enter_state(key, KeyState::Failed);
                Err(e)
            }
        }
    }

    fn track_fetch(&self, key: &ArtifactKey, stream: ByteStream) -> ByteStream {
        let stats = Arc::clone(&self.stats);
        let key = key.clone();
        stream
            .inspect_err(move |e| {
                stats.record_fetch_error();
                warn!(key = %key, error = %e, "artifact fetch failed");
            })
            .boxed()
    }

    /// Checks whether an artifact is stored, without opening a stream.
    ///
    /// # Errors
    ///
    /// Returns the backend's error when presence could not be determined.
    pub async fn contains(&self, key: &ArtifactKey) -> Result<bool> {
        self.ensure_open()?;
        self.provider.exists(key).await
    }

    /// Reads a whole artifact into memory. Intended for small artifacts.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup or the fetch fails.
    pub async fn fetch_bytes(&self, key: &ArtifactKey) -> Result<Option<Bytes>> {
        match self.lookup(key).await? {
            Lookup::Hit(stream) => storage::collect_bytes(stream).await.map(Some),
            Lookup::Miss => Ok(None),
        }
    }

    /// Opens an upload session for `key`.
    ///
    /// Only one session per key is open at a time. Depending on the configured
    /// [`ConflictPolicy`], a second request either fails with
    /// [`Error::UploadInProgress`] or waits for the first session to settle.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`], [`Error::ShutDown`],
    /// [`Error::UploadInProgress`], or the backend's error if the upload could
    /// not be started.
    pub async fn begin_upload(&self, key: &ArtifactKey) -> Result<UploadSession> {
        self.ensure_open()?;
        if self.options.read_only {
            self.stats.record_upload_rejected();
            return Err(Error::ReadOnly);
        }

        let slot = match self.uploads.acquire(key, self.options.conflict_policy).await {
            Ok(slot) => slot,
            Err(e) => {
                self.stats.record_upload_rejected();
                debug!(key = %key, error = %e, "upload rejected");
                return Err(e);
            }
        };

        // Shutdown may have started while this upload was queued
        self.ensure_open()?;

        let writer = match self.provider.create_write_stream(key).await {
            Ok(writer) => writer,
            Err(e) => {
                self.stats.record_upload_failure();
                warn!(key = %key, backend = self.provider.name(), error = %e, "unable to start upload");
                return Err(e);
            }
        };

        enter_state(key, KeyState::Uploading);
        Ok(UploadSession {
            key: key.clone(),
            writer: Some(writer),
            stats: Arc::clone(&self.stats),
            max_size: self.options.max_artifact_size,
            written: 0,
            state: KeyState::Uploading,
            _slot: slot,
        })
    }

    /// Uploads every chunk of `stream` under `key`.
    ///
    /// An error item from the source aborts the upload and is returned as is.
    ///
    /// # Errors
    ///
    /// Returns the source's error or any error from [`begin_upload`],
    /// [`UploadSession::write`] and [`UploadSession::finish`].
    ///
    /// [`begin_upload`]: CacheCoordinator::begin_upload
    pub async fn upload<S>(&self, key: &ArtifactKey, stream: S) -> Result<UploadReceipt>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let mut session = self.begin_upload(key).await?;
        tokio::pin!(stream);

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => session.write(chunk).await?,
                Err(e) => {
                    session.fail(&format!("source failed: {}", e));
                    session.abort().await;
                    return Err(e);
                }
            }
        }

        session.finish().await
    }

    /// Uploads everything read from `reader` under `key`.
    ///
    /// # Errors
    ///
    /// See [`upload`](CacheCoordinator::upload). Read failures surface as
    /// [`Error::Io`].
    pub async fn upload_reader<R>(&self, key: &ArtifactKey, reader: R) -> Result<UploadReceipt>
    where
        R: AsyncRead + Send,
    {
        self.upload(key, ReaderStream::new(reader).map_err(Error::from))
            .await
    }

    /// Uploads a local file under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or read.
    pub async fn upload_file(&self, key: &ArtifactKey, path: &Path) -> Result<UploadReceipt> {
        let file = tokio::fs::File::open(path).await?;
        self.upload_reader(key, file).await
    }

    /// Stops accepting new operations, waits for open upload sessions to
    /// settle, and shuts the provider down. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns the provider's shutdown error.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!(backend = self.provider.name(), "shutting down cache coordinator");
        self.uploads.wait_drained().await;
        self.provider.shutdown().await?;
        info!(stats = ?self.stats(), "cache coordinator stopped");
        Ok(())
    }
}

impl fmt::Debug for CacheCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCoordinator")
            .field("backend", &self.provider.name())
            .field("options", &self.options)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
