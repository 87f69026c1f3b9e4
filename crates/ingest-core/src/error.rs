//! Error types for the ingestion pipeline
//!
//! Taxonomy by blast radius:
//! - [`ResolutionError`] / [`ConfigError`]: fatal, the run aborts
//! - [`ClaimError::Conflict`]: another run has the asset, skip it
//! - [`AnalysisError`]: retried, then a permanent failure for that asset only
//! - [`WriteError`]: retried, then the claim is rolled back

use ingest_asset::{AssetKey, CommitError, PathError};
use ingest_store::{ClaimError, ObjectKey, StoreError};
use std::path::PathBuf;

/// Fatal pipeline error
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration could not be loaded or is invalid
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Change set could not be determined
    #[error("resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    /// Shared store unusable
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Claim table refused a transition
    #[error("claim error: {0}")]
    Claim(#[from] ClaimError),

    /// Worker pool failure
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Change-set resolution errors
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    /// Event has no path list and no diff source can supply one
    #[error("event for commit {0} carries no changed paths")]
    MissingChangeSet(String),

    /// Abbreviated commit id and no repository to expand it against
    #[error("commit {0} is abbreviated; a full SHA or a repository is required")]
    AbbreviatedCommit(String),

    /// Repository could not be opened
    #[error("cannot open repository at {path}: {message}")]
    Repository { path: PathBuf, message: String },

    /// Commit not present in the repository
    #[error("unknown commit {0}")]
    UnknownCommit(String),

    /// Diff could not be computed
    #[error("diff failed: {0}")]
    Diff(String),

    /// Malformed commit id in the event
    #[error("invalid commit id: {0}")]
    InvalidCommit(#[from] CommitError),

    /// Background task died
    #[error("diff task failed: {0}")]
    Task(String),
}

/// Analysis collaborator errors
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// Attempt exceeded the per-asset timeout
    #[error("analysis of {key} timed out after {after_ms}ms")]
    Timeout { key: AssetKey, after_ms: u64 },

    /// Image could not be decoded or is of an unsupported kind
    #[error("unsupported image {key}: {reason}")]
    Unsupported { key: AssetKey, reason: String },

    /// Collaborator temporarily unavailable
    #[error("analyzer unavailable for {key}: {reason}")]
    Unavailable { key: AssetKey, reason: String },

    /// Image bytes could not be read
    #[error("cannot read {key}: {source}")]
    Source {
        key: AssetKey,
        #[source]
        source: SourceError,
    },

    /// Analysis task panicked or was aborted
    #[error("analysis task for {key} failed: {reason}")]
    Task { key: AssetKey, reason: String },
}

impl AnalysisError {
    /// Check if a retry could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Unavailable { .. } => true,
            Self::Source { source, .. } => matches!(source, SourceError::Io { .. }),
            Self::Unsupported { .. } | Self::Task { .. } => false,
        }
    }
}

/// Asset byte-source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// File absent from the checkout (deleted or renamed after merge)
    #[error("{0} not found")]
    Missing(AssetKey),

    /// Filesystem failure
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result persistence errors
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// Payload could not be encoded
    #[error("cannot encode result: {0}")]
    Encode(#[from] serde_json::Error),

    /// Object store rejected the payload
    #[error("object write {key} failed: {source}")]
    Object {
        key: ObjectKey,
        #[source]
        source: StoreError,
    },

    /// Lookup table rejected the row
    #[error("table write for {key} failed: {source}")]
    Table {
        key: AssetKey,
        #[source]
        source: StoreError,
    },

    /// Object key could not be built
    #[error("invalid object key: {0}")]
    Key(StoreError),

    /// Claim could not be completed after the write
    #[error("claim completion failed: {0}")]
    Claim(#[from] ClaimError),
}

impl WriteError {
    /// Check if a retry could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Object { source, .. } | Self::Table { source, .. } => source.is_retryable(),
            Self::Encode(_) | Self::Key(_) | Self::Claim(_) => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file malformed
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Environment override malformed
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },

    /// Watched prefix is not a relative path
    #[error("invalid watch prefix: {0}")]
    Prefix(#[from] PathError),

    /// Semantic validation failed
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker panicked
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// Pool was closed while jobs were pending
    #[error("worker pool closed")]
    Closed,
}

/// Errors that know whether retrying may help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for AnalysisError {
    fn is_retryable(&self) -> bool {
        AnalysisError::is_retryable(self)
    }
}

impl Retryable for WriteError {
    fn is_retryable(&self) -> bool {
        WriteError::is_retryable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AssetKey {
        AssetKey::new("images/cat.png").unwrap()
    }

    #[test]
    fn analysis_error_retryable() {
        assert!(AnalysisError::Timeout {
            key: key(),
            after_ms: 10
        }
        .is_retryable());
        assert!(!AnalysisError::Unsupported {
            key: key(),
            reason: "not an image".into()
        }
        .is_retryable());
        assert!(!AnalysisError::Source {
            key: key(),
            source: SourceError::Missing(key())
        }
        .is_retryable());
    }

    #[test]
    fn write_error_retryable_follows_store() {
        let transient = WriteError::Table {
            key: key(),
            source: StoreError::Unavailable("throttled".into()),
        };
        assert!(transient.is_retryable());

        let bad_key = WriteError::Key(StoreError::InvalidKey("..".into()));
        assert!(!bad_key.is_retryable());
    }

    #[test]
    fn pipeline_error_display() {
        let err = PipelineError::from(ResolutionError::UnknownCommit("abc1234".into()));
        assert_eq!(err.to_string(), "resolution failed: unknown commit abc1234");
    }
}
