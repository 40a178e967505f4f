//! Storage provider contract and backend implementations.

mod filesystem;
mod http;
mod object;
mod writer;

pub use filesystem::FilesystemProvider;
pub use http::HttpProvider;
pub use object::ObjectStoreProvider;
pub use writer::{ArtifactWriter, UploadReceipt};

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::config::{BackendConfig, CacheConfig};
use crate::error::Result;
use crate::key::ArtifactKey;

/// Artifact bytes as a lazily consumed stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Contract every storage backend satisfies.
///
/// Implementations hold one long-lived client (connection pool, object store
/// handle, directory root) and are shared behind `Arc<dyn StorageProvider>`.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Checks whether an artifact is stored.
    ///
    /// Returns `Ok(false)` only when the backend positively reports the
    /// artifact as missing.
    ///
    /// # Errors
    ///
    /// Any other failure (network, permissions, timeouts) is returned as an
    /// error and never reported as absence.
    async fn exists(&self, key: &ArtifactKey) -> Result<bool>;

    /// Returns a stream over the artifact's bytes.
    ///
    /// The backend request starts on the first poll, so consumers never miss
    /// leading bytes. A failed fetch, including a missing artifact, yields an
    /// `Err` item instead of ending the stream early. Dropping the stream
    /// cancels the request.
    fn create_read_stream(&self, key: &ArtifactKey) -> ByteStream;

    /// Opens a write stream for the artifact.
    ///
    /// Nothing becomes visible under `key` until [`ArtifactWriter::finish`]
    /// resolves successfully.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses to start the upload.
    async fn create_write_stream(&self, key: &ArtifactKey) -> Result<ArtifactWriter>;

    /// Releases backend resources. Called once by the coordinator on shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Backend side of one upload, driven by an [`ArtifactWriter`].
///
/// `write` is called for every chunk in order, then exactly one of
/// `complete` or `abort`. `abort` is also called after a failed `write`.
#[async_trait]
pub trait UploadSink: Send {
    /// Accepts the next chunk. May suspend until the backend has capacity.
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Commits the upload. Resolves once the backend confirms persistence.
    async fn complete(self: Box<Self>) -> Result<()>;

    /// Discards the upload and releases backend resources.
    async fn abort(self: Box<Self>);
}

/// Builds the provider described by `config`.
///
/// # Errors
///
/// Returns [`crate::Error::Configuration`] if the configuration is invalid or the
/// client cannot be constructed.
pub fn build_provider(config: &CacheConfig) -> Result<Arc<dyn StorageProvider>> {
    config.validate()?;
    let chunks = config.cache.write_buffer_chunks;

    let provider: Arc<dyn StorageProvider> = match &config.backend {
        BackendConfig::ObjectStore(backend) => {
            Arc::new(ObjectStoreProvider::s3(backend)?.with_write_buffer_chunks(chunks))
        }
        BackendConfig::Filesystem(backend) => {
            Arc::new(FilesystemProvider::new(&backend.root)?.with_write_buffer_chunks(chunks))
        }
        BackendConfig::Http(backend) => {
            Arc::new(HttpProvider::new(backend)?.with_write_buffer_chunks(chunks))
        }
        BackendConfig::Memory => {
            Arc::new(ObjectStoreProvider::in_memory().with_write_buffer_chunks(chunks))
        }
    };

    Ok(provider)
}

/// Drains a stream into one buffer. Intended for small artifacts and tests.
///
/// # Errors
///
/// Returns the first error yielded by the stream.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
