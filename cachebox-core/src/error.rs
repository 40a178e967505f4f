//! Error types and result aliases.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Artifact not found: {key}")]
    NotFound { key: String },

    #[error("Transient backend failure for {key}: {message}")]
    Transient { key: String, message: String },

    #[error("Backend error for {key}: {message}")]
    Backend { key: String, message: String },

    #[error("Upload already in progress for {key}")]
    UploadInProgress { key: String },

    #[error("Artifact {key} exceeds maximum size of {limit} bytes")]
    ArtifactTooLarge { key: String, limit: u64 },

    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),

    #[error("Cache is read-only, uploads are disabled")]
    ReadOnly,

    #[error("Cache has been shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error in {context}: {error}")]
    Toml {
        error: toml::de::Error,
        context: String,
    },
}

/// Coarse classification of an [`Error`], used by callers deciding whether to
/// retry, fall back to a local build, or alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Transient,
    Backend,
    Conflict,
    Policy,
    Local,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::Toml { .. } => ErrorKind::Configuration,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Backend { .. } => ErrorKind::Backend,
            Error::UploadInProgress { .. } => ErrorKind::Conflict,
            Error::ArtifactTooLarge { .. }
            | Error::InvalidKey(_)
            | Error::ReadOnly
            | Error::ShutDown => ErrorKind::Policy,
            Error::Io(_) => ErrorKind::Local,
        }
    }

    /// Returns true when repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Conflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn transient(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transient {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn backend(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Backend {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Toml {
            error,
            context: "cachebox.toml".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_and_conflict_are_retryable() {
        assert!(Error::transient("k", "timeout").is_retryable());
        assert!(Error::UploadInProgress { key: "k".into() }.is_retryable());
        assert!(!Error::backend("k", "access denied").is_retryable());
        assert!(!Error::NotFound { key: "k".into() }.is_retryable());
        assert!(!Error::Configuration("bucket".into()).is_retryable());
    }

    #[test]
    fn test_not_found_is_distinct_from_failure() {
        assert!(Error::NotFound { key: "k".into() }.is_not_found());
        assert!(!Error::transient("k", "connection reset").is_not_found());
        assert_eq!(
            Error::backend("k", "quota").kind(),
            ErrorKind::Backend
        );
    }
}
