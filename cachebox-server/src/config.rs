//! Server configuration.

use std::path::{Path, PathBuf};

use cachebox_core::{BackendConfig, CacheConfig, FilesystemConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Storage backend and cache behaviour.
    pub cache: CacheConfig,
    /// Bind address.
    pub bind_address: String,
    /// Port number.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::new(BackendConfig::Filesystem(FilesystemConfig::new("./cache"))),
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the cache section from a `cachebox.toml` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> cachebox_core::Result<Self> {
        Ok(Self {
            cache: CacheConfig::load(path)?,
            ..Self::default()
        })
    }

    /// Stores artifacts in a local directory.
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.backend = BackendConfig::Filesystem(FilesystemConfig::new(dir));
        self
    }

    /// Sets the maximum artifact size.
    pub fn with_max_artifact_size(mut self, size: u64) -> Self {
        self.cache.cache.max_artifact_size = Some(size);
        self
    }

    /// Sets the bind address.
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Sets the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Returns the bind address as a string.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}
