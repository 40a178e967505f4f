//! Filesystem backend.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::key::ArtifactKey;

use super::{ArtifactWriter, ByteStream, StorageProvider, UploadSink};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Temp files older than this are considered leftovers of crashed uploads.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Stores artifacts in a local directory.
///
/// Layout under the root:
/// - `objects/aa/bb/<sha256(key)>`: committed artifacts, sharded by digest prefix
/// - `tmp/<uuid>.tmp`: in-flight uploads, renamed into place on commit
///
/// Hashing the key keeps file names short and injective for any valid key,
/// including keys with `/` segments.
pub struct FilesystemProvider {
    root: PathBuf,
    write_buffer_chunks: usize,
}

impl FilesystemProvider {
    /// Creates a new filesystem provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage directories cannot be created.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("tmp"))?;

        let provider = Self {
            root,
            write_buffer_chunks: crate::config::DEFAULT_WRITE_BUFFER_CHUNKS,
        };
        provider.cleanup_temp_files(STALE_TEMP_AGE)?;
        Ok(provider)
    }

    pub fn with_write_buffer_chunks(mut self, chunks: usize) -> Self {
        self.write_buffer_chunks = chunks.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Gets the artifact file path for a key.
    pub fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(key.as_str().as_bytes()));
        self.root
            .join("objects")
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(&digest)
    }

    fn temp_path(&self) -> PathBuf {
        let uuid = uuid::Uuid::new_v4();
        self.root.join("tmp").join(format!("{}.tmp", uuid))
    }

    /// Removes temp files left behind by uploads that never settled.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp directory cannot be listed.
    pub fn cleanup_temp_files(&self, older_than: Duration) -> Result<usize> {
        let tmp_dir = self.root.join("tmp");
        if !tmp_dir.exists() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&tmp_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("tmp") {
                continue;
            }

            let stale = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map(|modified| {
                    now.duration_since(modified).unwrap_or_default() >= older_than
                })
                .unwrap_or(false);

            // Ignore errors, another process may have just renamed it
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, dir = %tmp_dir.display(), "removed stale temp files");
        }
        Ok(removed)
    }
}

fn classify_io(key: &ArtifactKey, err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => Error::NotFound {
            key: key.to_string(),
        },
        io::ErrorKind::PermissionDenied => Error::backend(key.as_str(), err.to_string()),
        _ => Error::transient(key.as_str(), err.to_string()),
    }
}

#[async_trait]
impl StorageProvider for FilesystemProvider {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        match tokio::fs::metadata(self.artifact_path(key)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(classify_io(key, e)),
        }
    }

    fn create_read_stream(&self, key: &ArtifactKey) -> ByteStream {
        let path = self.artifact_path(key);
        let key = key.clone();

        futures::stream::once(async move {
            let file = tokio::fs::File::open(&path)
                .await
                .map_err(|e| classify_io(&key, e))?;
            Ok::<_, Error>(
                ReaderStream::with_capacity(file, READ_CHUNK_SIZE)
                    .map_err(move |e| classify_io(&key, e)),
            )
        })
        .try_flatten()
        .boxed()
    }

    async fn create_write_stream(&self, key: &ArtifactKey) -> Result<ArtifactWriter> {
        let temp_path = self.temp_path();
        let file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| classify_io(key, e))?;

        let sink = FileSink {
            key: key.clone(),
            file,
            temp_path,
            final_path: self.artifact_path(key),
        };

        Ok(ArtifactWriter::spawn(
            key.clone(),
            Box::new(sink),
            self.write_buffer_chunks,
        ))
    }
}

struct FileSink {
    key: ArtifactKey,
    file: tokio::fs::File,
    temp_path: PathBuf,
    final_path: PathBuf,
}

impl FileSink {
    async fn commit(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if let Some(parent) = self.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Atomic rename, readers see either the old artifact or the new one
        tokio::fs::rename(&self.temp_path, &self.final_path).await
    }
}

#[async_trait]
impl UploadSink for FileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .map_err(|e| classify_io(&self.key, e))
    }

    async fn complete(self: Box<Self>) -> Result<()> {
        let mut sink = *self;
        if let Err(e) = sink.commit().await {
            let _ = tokio::fs::remove_file(&sink.temp_path).await;
            warn!(key = %sink.key, error = %e, "failed to commit artifact");
            return Err(classify_io(&sink.key, e));
        }
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let FileSink { file, temp_path, .. } = *self;
        drop(file);
        let _ = tokio::fs::remove_file(&temp_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collect_bytes;
    use tempfile::TempDir;

    fn key(s: &str) -> ArtifactKey {
        ArtifactKey::new(s).unwrap()
    }

    #[test]
    fn test_artifact_path_sharding() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::new(temp_dir.path()).unwrap();

        let path = provider.artifact_path(&key("ci/linux/build-42"));
        let file_name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(file_name.len(), 64);

        let shard2 = path.parent().unwrap();
        let shard1 = shard2.parent().unwrap();
        assert_eq!(shard1.file_name().unwrap().to_str().unwrap(), &file_name[..2]);
        assert_eq!(shard2.file_name().unwrap().to_str().unwrap(), &file_name[2..4]);
        assert!(path.starts_with(temp_dir.path().join("objects")));
    }

    #[tokio::test]
    async fn test_filesystem_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::new(temp_dir.path()).unwrap();
        let key = key("build-42");

        assert!(!provider.exists(&key).await.unwrap());

        let mut writer = provider.create_write_stream(&key).await.unwrap();
        writer.write(Bytes::from_static(b"ABC")).await.unwrap();
        writer.write(Bytes::from_static(b"DEFG")).await.unwrap();

        // Nothing is visible before commit
        assert!(!provider.exists(&key).await.unwrap());

        let receipt = writer.finish().await.unwrap();
        assert_eq!(receipt.size, 7);
        assert!(provider.exists(&key).await.unwrap());

        let data = collect_bytes(provider.create_read_stream(&key)).await.unwrap();
        assert_eq!(&data[..], b"ABCDEFG");
    }

    #[tokio::test]
    async fn test_abort_removes_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::new(temp_dir.path()).unwrap();
        let key = key("aborted");

        let mut writer = provider.create_write_stream(&key).await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        writer.abort().await;

        assert!(!provider.exists(&key).await.unwrap());
        let leftovers = fs::read_dir(temp_dir.path().join("tmp")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_whole_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::new(temp_dir.path()).unwrap();
        let key = key("replaced");

        for payload in [&b"first version, longer"[..], &b"second"[..]] {
            let mut writer = provider.create_write_stream(&key).await.unwrap();
            writer.write(Bytes::copy_from_slice(payload)).await.unwrap();
            writer.finish().await.unwrap();
        }

        let data = collect_bytes(provider.create_read_stream(&key)).await.unwrap();
        assert_eq!(&data[..], b"second");
    }

    #[test]
    fn test_cleanup_only_removes_stale_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let provider = FilesystemProvider::new(temp_dir.path()).unwrap();

        let fresh = temp_dir.path().join("tmp").join("fresh.tmp");
        fs::write(&fresh, b"in flight").unwrap();

        assert_eq!(provider.cleanup_temp_files(STALE_TEMP_AGE).unwrap(), 0);
        assert!(fresh.exists());

        assert_eq!(provider.cleanup_temp_files(Duration::ZERO).unwrap(), 1);
        assert!(!fresh.exists());
    }
}
