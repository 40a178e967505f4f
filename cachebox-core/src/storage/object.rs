//! Object storage backend (S3-compatible buckets and in-memory stores).

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::error::{Error, Result};
use crate::key::ArtifactKey;

use super::{ArtifactWriter, ByteStream, StorageProvider, UploadSink};

/// Parts uploaded concurrently before `write` waits for the backend.
const MAX_CONCURRENT_PARTS: usize = 4;

/// Storage provider over any [`ObjectStore`].
pub struct ObjectStoreProvider {
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
    name: &'static str,
    write_buffer_chunks: usize,
}

impl ObjectStoreProvider {
    /// Wraps an existing object store.
    pub fn from_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: None,
            name: "object-store",
            write_buffer_chunks: crate::config::DEFAULT_WRITE_BUFFER_CHUNKS,
        }
    }

    /// Creates a provider backed by process memory.
    pub fn in_memory() -> Self {
        let mut provider = Self::from_store(Arc::new(InMemory::new()));
        provider.name = "memory";
        provider
    }

    /// Builds an S3 client from configuration.
    ///
    /// No request is sent; credentials and connectivity are only exercised by
    /// the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the configuration is invalid or the
    /// client cannot be built.
    pub fn s3(config: &ObjectStoreConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = AmazonS3Builder::new().with_bucket_name(config.bucket()?);

        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
            if let Some(token) = &config.session_token {
                builder = builder.with_token(token);
            }
        }
        builder = builder.with_allow_http(config.allow_http);

        for (key, value) in &config.options {
            let key = AmazonS3ConfigKey::from_str(key).map_err(|e| {
                Error::Configuration(format!("invalid s3 option {}: {}", key, e))
            })?;
            builder = builder.with_config(key, value);
        }

        let store = builder
            .build()
            .map_err(|e| Error::Configuration(format!("unable to build s3 client: {}", e)))?;

        let mut provider = Self::from_store(Arc::new(store));
        provider.name = "s3";
        provider.prefix = config
            .prefix
            .as_ref()
            .map(|prefix| prefix.trim_matches('/').to_string());
        Ok(provider)
    }

    /// Stores every artifact under `prefix/` inside the store.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into().trim_matches('/').to_string());
        self
    }

    pub fn with_write_buffer_chunks(mut self, chunks: usize) -> Self {
        self.write_buffer_chunks = chunks.max(1);
        self
    }

    fn object_path(&self, key: &ArtifactKey) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => ObjectPath::from(format!("{}/{}", prefix, key)),
            None => ObjectPath::from(key.as_str()),
        }
    }
}

/// Maps an object store error onto the cache error taxonomy.
pub(crate) fn classify(key: &ArtifactKey, err: object_store::Error) -> Error {
    use object_store::Error as StoreError;

    match err {
        StoreError::NotFound { .. } => Error::NotFound {
            key: key.to_string(),
        },
        e @ (StoreError::PermissionDenied { .. }
        | StoreError::Unauthenticated { .. }
        | StoreError::NotSupported { .. }
        | StoreError::NotImplemented
        | StoreError::InvalidPath { .. }
        | StoreError::UnknownConfigurationKey { .. }
        | StoreError::AlreadyExists { .. }
        | StoreError::Precondition { .. }) => Error::backend(key.as_str(), e.to_string()),
        e => Error::transient(key.as_str(), e.to_string()),
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        match self.store.head(&self.object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(classify(key, e)),
        }
    }

    fn create_read_stream(&self, key: &ArtifactKey) -> ByteStream {
        let store = Arc::clone(&self.store);
        let path = self.object_path(key);
        let key = key.clone();

        futures::stream::once(async move {
            let result = store.get(&path).await.map_err(|e| classify(&key, e))?;
            debug!(key = %key, size = result.meta.size, "object fetch started");
            Ok::<_, Error>(result.into_stream().map_err(move |e| classify(&key, e)))
        })
        .try_flatten()
        .boxed()
    }

    async fn create_write_stream(&self, key: &ArtifactKey) -> Result<ArtifactWriter> {
        let upload = self
            .store
            .put_multipart(&self.object_path(key))
            .await
            .map_err(|e| classify(key, e))?;

        let sink = MultipartSink {
            key: key.clone(),
            upload: WriteMultipart::new(upload),
        };

        Ok(ArtifactWriter::spawn(
            key.clone(),
            Box::new(sink),
            self.write_buffer_chunks,
        ))
    }
}

struct MultipartSink {
    key: ArtifactKey,
    upload: WriteMultipart,
}

#[async_trait]
impl UploadSink for MultipartSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.upload
            .wait_for_capacity(MAX_CONCURRENT_PARTS)
            .await
            .map_err(|e| classify(&self.key, e))?;
        self.upload.write(&chunk);
        Ok(())
    }

    async fn complete(self: Box<Self>) -> Result<()> {
        let MultipartSink { key, upload } = *self;
        upload.finish().await.map_err(|e| classify(&key, e))?;
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        let MultipartSink { key, upload } = *self;
        if let Err(e) = upload.abort().await {
            debug!(key = %key, error = %e, "multipart abort failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collect_bytes;

    fn key(s: &str) -> ArtifactKey {
        ArtifactKey::new(s).unwrap()
    }

    #[test]
    fn test_classify_not_found() {
        let err = object_store::Error::NotFound {
            path: "build-42".to_string(),
            source: "missing".into(),
        };
        assert!(classify(&key("build-42"), err).is_not_found());
    }

    #[test]
    fn test_classify_generic_is_transient() {
        let err = object_store::Error::Generic {
            store: "S3",
            source: "connection reset by peer".into(),
        };
        let classified = classify(&key("build-42"), err);
        assert!(matches!(classified, Error::Transient { .. }));
        assert!(classified.is_retryable());
    }

    #[test]
    fn test_classify_permission_is_backend() {
        let err = object_store::Error::PermissionDenied {
            path: "build-42".to_string(),
            source: "access denied".into(),
        };
        assert!(matches!(
            classify(&key("build-42"), err),
            Error::Backend { .. }
        ));
    }

    #[tokio::test]
    async fn test_prefix_is_applied() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let provider = ObjectStoreProvider::from_store(Arc::clone(&store)).with_prefix("/ci/");

        let mut writer = provider.create_write_stream(&key("build-1")).await.unwrap();
        writer.write(Bytes::from_static(b"data")).await.unwrap();
        writer.finish().await.unwrap();

        assert!(store.head(&ObjectPath::from("ci/build-1")).await.is_ok());
        assert!(provider.exists(&key("build-1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_object_read_yields_not_found() {
        let provider = ObjectStoreProvider::in_memory();
        let err = collect_bytes(provider.create_read_stream(&key("missing-key")))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let err = ObjectStoreProvider::s3(&ObjectStoreConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_s3_builds_without_network() {
        let mut config = ObjectStoreConfig::new("build-cache")
            .with_region("us-east-1")
            .with_endpoint("http://127.0.0.1:9000")
            .with_credentials("minio", "minio123")
            .with_option("aws_virtual_hosted_style_request", "false");
        config.allow_http = true;

        let provider = ObjectStoreProvider::s3(&config).unwrap();
        assert_eq!(provider.name(), "s3");
    }
}
