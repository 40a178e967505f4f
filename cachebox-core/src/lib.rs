//! Remote artifact cache storage for build systems.
//!
//! A [`CacheCoordinator`] decides hits and misses against a pluggable
//! [`StorageProvider`] (object storage, filesystem, HTTP server or memory),
//! streams artifact bytes in both directions and serializes uploads per key.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod key;
pub mod stats;
pub mod storage;

pub use config::{
    BackendConfig, CacheConfig, CacheOptions, ConflictPolicy, FilesystemConfig, HttpConfig,
    ObjectStoreConfig,
};
pub use coordinator::{CacheCoordinator, KeyState, Lookup, UploadSession};
pub use error::{Error, ErrorKind, Result};
pub use key::{hash_file, ArtifactKey, FingerprintBuilder};
pub use stats::{CacheStats, StatsSnapshot};
pub use storage::{
    build_provider, collect_bytes, ArtifactWriter, ByteStream, FilesystemProvider, HttpProvider,
    ObjectStoreProvider, StorageProvider, UploadReceipt, UploadSink,
};
