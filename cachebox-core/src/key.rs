//! Artifact keys and deterministic fingerprint construction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Longest key accepted, matching the S3 object key limit.
pub const MAX_KEY_LEN: usize = 1024;

/// Opaque identifier of one cached artifact.
///
/// Keys are validated once at construction and never change afterwards. They
/// may contain `/`-separated segments, but never empty, `.` or `..` segments,
/// so every backend can map a key to a path without escaping its root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactKey(String);

impl ArtifactKey {
    /// Validates and wraps a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if the key is empty, too long, contains
    /// characters outside `[A-Za-z0-9._-/]`, or has an empty, `.` or `..` segment.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Returns the key's `/`-separated segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Creates a new fingerprint builder.
    pub fn fingerprint() -> FingerprintBuilder {
        FingerprintBuilder::new()
    }
}

fn validate(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "key is {} bytes, maximum is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if let Some(c) = key
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/')))
    {
        return Err(Error::InvalidKey(format!(
            "key {:?} contains invalid character {:?}",
            key, c
        )));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(Error::InvalidKey(format!(
                "key {:?} contains an empty or relative segment",
                key
            )));
        }
    }
    Ok(())
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ArtifactKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ArtifactKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for ArtifactKey {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ArtifactKey> for String {
    fn from(key: ArtifactKey) -> Self {
        key.0
    }
}

/// Builder that hashes build inputs into a deterministic [`ArtifactKey`].
///
/// Every input that affects the artifact should be added: named inputs such
/// as the command line or toolchain version, an explicit allowlist of
/// environment variables, and digests of the input files. Inputs are kept in
/// sorted maps so insertion order never changes the key.
#[derive(Debug, Default)]
pub struct FingerprintBuilder {
    namespace: Option<String>,
    inputs: BTreeMap<String, String>,
    env_vars: BTreeMap<String, String>,
    input_files: BTreeMap<PathBuf, String>,
}

impl FingerprintBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Sets a namespace that prefixes the final key (`<namespace>/<hash>`).
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Adds a named input, e.g. `("command", "cargo build --release")`.
    pub fn input(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Adds an environment variable to the fingerprint.
    ///
    /// Only explicitly allowed environment variables should be added.
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Adds multiple environment variables.
    pub fn env_vars(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env_vars.extend(vars);
        self
    }

    /// Adds an input file digest computed elsewhere.
    pub fn input_file(mut self, path: impl Into<PathBuf>, digest: impl Into<String>) -> Self {
        self.input_files.insert(path.into(), digest.into());
        self
    }

    /// Builds the key.
    ///
    /// # Errors
    ///
    /// Returns an error if no input was added or the namespace is not a valid key prefix.
    pub fn build(self) -> Result<ArtifactKey> {
        if self.inputs.is_empty() && self.env_vars.is_empty() && self.input_files.is_empty() {
            return Err(Error::InvalidKey(
                "fingerprint needs at least one input".to_string(),
            ));
        }

        let mut hasher = Sha256::new();
        // Section tags and NUL separators keep distinct input sets from colliding.
        for (name, value) in &self.inputs {
            hasher.update(b"input\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        for (name, value) in &self.env_vars {
            hasher.update(b"env\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        for (path, digest) in &self.input_files {
            hasher.update(b"file\0");
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(digest.as_bytes());
            hasher.update(b"\0");
        }
        let hash = format!("{:x}", hasher.finalize());

        match self.namespace {
            Some(namespace) => ArtifactKey::new(format!("{}/{}", namespace, hash)),
            None => ArtifactKey::new(hash),
        }
    }
}

/// Computes the BLAKE3 digest of a file without loading it into memory.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(ArtifactKey::new("build-42").is_ok());
        assert!(ArtifactKey::new("ci/linux/abc123.tar.zst").is_ok());

        assert!(ArtifactKey::new("").is_err());
        assert!(ArtifactKey::new("/leading").is_err());
        assert!(ArtifactKey::new("trailing/").is_err());
        assert!(ArtifactKey::new("a//b").is_err());
        assert!(ArtifactKey::new("a/../b").is_err());
        assert!(ArtifactKey::new("./a").is_err());
        assert!(ArtifactKey::new("has space").is_err());
        assert!(ArtifactKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn test_fingerprint_determinism() {
        let key1 = ArtifactKey::fingerprint()
            .input("command", "cargo build")
            .input("toolchain", "rustc-1.80.0")
            .env_var("PROFILE", "release")
            .build()
            .unwrap();

        let key2 = ArtifactKey::fingerprint()
            .env_var("PROFILE", "release")
            .input("toolchain", "rustc-1.80.0")
            .input("command", "cargo build")
            .build()
            .unwrap();

        assert_eq!(key1, key2);
        assert_eq!(key1.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_different_inputs() {
        let key1 = ArtifactKey::fingerprint()
            .input("command", "echo hello")
            .build()
            .unwrap();
        let key2 = ArtifactKey::fingerprint()
            .input("command", "echo world")
            .build()
            .unwrap();

        assert_ne!(key1, key2);
    }

    #[test]
    fn test_fingerprint_sections_do_not_collide() {
        let as_input = ArtifactKey::fingerprint().input("A", "1").build().unwrap();
        let as_env = ArtifactKey::fingerprint().env_var("A", "1").build().unwrap();

        assert_ne!(as_input, as_env);
    }

    #[test]
    fn test_fingerprint_namespace() {
        let key = ArtifactKey::fingerprint()
            .namespace("ci")
            .input("command", "make")
            .build()
            .unwrap();

        assert!(key.as_str().starts_with("ci/"));
        assert!(ArtifactKey::fingerprint().build().is_err());
    }

    #[tokio::test]
    async fn test_hash_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"content").unwrap();

        let digest = hash_file(&path).await.unwrap();
        assert_eq!(digest, blake3::hash(b"content").to_hex().to_string());
    }
}
