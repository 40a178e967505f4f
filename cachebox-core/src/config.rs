//! Configuration for the artifact cache and its storage backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use object_store::aws::AmazonS3ConfigKey;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum artifact size (1GB).
pub const DEFAULT_MAX_ARTIFACT_SIZE: u64 = 1024 * 1024 * 1024;

/// Default number of chunks buffered between a writer and its backend upload.
pub const DEFAULT_WRITE_BUFFER_CHUNKS: usize = 4;

/// Top-level configuration, usually loaded from `cachebox.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheOptions,
}

/// Storage backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// S3-compatible object storage.
    #[serde(rename = "s3")]
    ObjectStore(ObjectStoreConfig),
    /// Local or network-mounted directory.
    Filesystem(FilesystemConfig),
    /// A cachebox HTTP server.
    Http(HttpConfig),
    /// Process-local store, mostly for tests.
    Memory,
}

/// Object storage options.
///
/// Only `bucket` is mandatory. Credentials are taken from this struct only;
/// no environment fallback is applied here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    /// Key prefix inside the bucket.
    pub prefix: Option<String>,
    /// Allow plain HTTP endpoints (MinIO, localstack).
    #[serde(default)]
    pub allow_http: bool,
    /// Backend-specific passthrough options, keyed by `object_store` S3 config names.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

/// What to do when an upload for a key that is already being uploaded starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the second upload with `UploadInProgress`.
    #[default]
    Reject,
    /// Queue the second upload until the first one settles.
    Wait,
}

/// Coordinator behaviour, independent of the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Read-only mode (disable uploads).
    pub read_only: bool,
    /// Maximum artifact size in bytes.
    pub max_artifact_size: Option<u64>,
    pub conflict_policy: ConflictPolicy,
    pub write_buffer_chunks: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            max_artifact_size: Some(DEFAULT_MAX_ARTIFACT_SIZE),
            conflict_policy: ConflictPolicy::Reject,
            write_buffer_chunks: DEFAULT_WRITE_BUFFER_CHUNKS,
        }
    }
}

impl CacheOptions {
    /// Sets read-only mode.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets maximum artifact size.
    pub fn max_artifact_size(mut self, size: u64) -> Self {
        self.max_artifact_size = Some(size);
        self
    }

    pub fn unlimited_size(mut self) -> Self {
        self.max_artifact_size = None;
        self
    }

    pub fn conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn write_buffer_chunks(mut self, chunks: usize) -> Self {
        self.write_buffer_chunks = chunks;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a zero buffer or a zero size limit.
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_chunks == 0 {
            return Err(Error::Configuration(
                "write_buffer_chunks must be at least 1".to_string(),
            ));
        }
        if self.max_artifact_size == Some(0) {
            return Err(Error::Configuration(
                "max_artifact_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl ObjectStoreConfig {
    /// Creates a configuration for the given bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: Some(bucket.into()),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_credentials(
        mut self,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        self.access_key_id = Some(access_key_id.into());
        self.secret_access_key = Some(secret_access_key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Returns the bucket name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the bucket is missing or blank.
    pub fn bucket(&self) -> Result<&str> {
        match self.bucket.as_deref().map(str::trim) {
            Some(bucket) if !bucket.is_empty() => Ok(bucket),
            _ => Err(Error::Configuration(
                "bucket is required for the s3 backend".to_string(),
            )),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a missing bucket, half-specified
    /// credentials, or an unknown passthrough option.
    pub fn validate(&self) -> Result<()> {
        self.bucket()?;

        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(Error::Configuration(
                "access_key_id and secret_access_key must be set together".to_string(),
            ));
        }

        for key in self.options.keys() {
            AmazonS3ConfigKey::from_str(key).map_err(|_| {
                Error::Configuration(format!("unknown s3 passthrough option: {}", key))
            })?;
        }

        if let Some(prefix) = &self.prefix {
            if prefix.trim_matches('/').is_empty() {
                return Err(Error::Configuration(
                    "prefix must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl FilesystemConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl HttpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }

    /// Sets the authentication token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the connect and response-header timeout.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl BackendConfig {
    /// Validates the backend options without touching the network.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first invalid option.
    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::ObjectStore(config) => config.validate(),
            BackendConfig::Filesystem(config) => {
                if config.root.as_os_str().is_empty() {
                    return Err(Error::Configuration(
                        "root is required for the filesystem backend".to_string(),
                    ));
                }
                Ok(())
            }
            BackendConfig::Http(config) => {
                if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
                    return Err(Error::Configuration(format!(
                        "http backend url must start with http:// or https://, got {:?}",
                        config.url
                    )));
                }
                Ok(())
            }
            BackendConfig::Memory => Ok(()),
        }
    }
}

impl CacheConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            cache: CacheOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.cache = options;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the backend or cache options are invalid.
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;
        self.cache.validate()
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CacheConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: CacheConfig = toml::from_str(&content).map_err(|error| Error::Toml {
            error,
            context: path.display().to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bucket_is_configuration_error() {
        let config = ObjectStoreConfig::default().with_region("eu-west-1");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("bucket is required"));

        let blank = ObjectStoreConfig::new("   ");
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_half_credentials_rejected() {
        let mut config = ObjectStoreConfig::new("cache");
        config.access_key_id = Some("AKIA".to_string());
        assert!(config.validate().is_err());

        let config = ObjectStoreConfig::new("cache").with_credentials("AKIA", "secret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_passthrough_option_names_checked() {
        let ok = ObjectStoreConfig::new("cache")
            .with_option("aws_virtual_hosted_style_request", "false");
        assert!(ok.validate().is_ok());

        let bad = ObjectStoreConfig::new("cache").with_option("no_such_option", "1");
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_cache_options_defaults() {
        let options = CacheOptions::default();
        assert!(!options.read_only);
        assert_eq!(options.max_artifact_size, Some(DEFAULT_MAX_ARTIFACT_SIZE));
        assert_eq!(options.conflict_policy, ConflictPolicy::Reject);
        assert!(options.validate().is_ok());
        assert!(options.write_buffer_chunks(0).validate().is_err());
    }
}
