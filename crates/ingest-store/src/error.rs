//! Error types for the storage layer
//!
//! - [`StoreError`]: a backend could not complete an operation
//! - [`ClaimError`]: a claim-table conditional write was refused

use crate::record::{ClaimKey, RecordState, RunId};
use std::path::PathBuf;

/// Backend failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem error
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Per-key lock could not be taken in time
    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    /// Object key failed validation
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    /// Backend refused the request
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Build an IO error carrying the offending path
    #[inline]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if a retry could succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::LockTimeout(_) | Self::Unavailable(_)
        )
    }
}

/// Refused claim-table transition
#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    /// Another run holds a live claim, or the pair already succeeded
    #[error("claim conflict on {key}: {state} by run {holder}")]
    Conflict {
        key: ClaimKey,
        holder: RunId,
        state: RecordState,
    },

    /// Caller is not the current holder (claim missing or taken over)
    #[error("run {run} does not hold the claim on {key}")]
    NotHolder { key: ClaimKey, run: RunId },

    /// Transition not permitted from the current state
    #[error("illegal transition on {key}: {from} -> {to}")]
    IllegalTransition {
        key: ClaimKey,
        from: RecordState,
        to: RecordState,
    },

    /// Backend failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClaimError {
    /// Check if this is the non-fatal "someone else has it" case
    #[inline]
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
