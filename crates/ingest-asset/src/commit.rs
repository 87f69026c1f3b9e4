//! Commit identifiers and branch refs

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Hex commit id, stored lowercase
///
/// Both abbreviated and full SHAs parse. Only full ids ([`Self::is_full`])
/// are used as idempotency keys; abbreviated ones are expanded against the
/// repository first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitSha(String);

impl CommitSha {
    /// Minimum accepted length (git's default abbreviation)
    pub const MIN_LEN: usize = 7;
    /// Maximum accepted length (SHA-256 object ids)
    pub const MAX_LEN: usize = 64;

    /// Validate and normalize a commit id
    ///
    /// # Errors
    /// Returns error if the id is not 7..=64 hex characters
    pub fn new(raw: &str) -> Result<Self, CommitError> {
        let trimmed = raw.trim();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&trimmed.len()) {
            return Err(CommitError::InvalidLength(trimmed.len()));
        }
        if let Some(c) = trimmed.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(CommitError::InvalidCharacter(c));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    /// Id as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check for a complete SHA-1 (40) or SHA-256 (64) object id
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self.0.len(), 40 | 64)
    }

    /// First seven characters, for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..Self::MIN_LEN]
    }
}

impl Display for CommitSha {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CommitSha {
    type Err = CommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for CommitSha {
    type Error = CommitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<CommitSha> for String {
    fn from(sha: CommitSha) -> Self {
        sha.0
    }
}

/// Branch name from a git ref
///
/// `refs/heads/main` → `main`. A bare name is returned unchanged; an empty
/// ref falls back to `main`.
#[must_use]
pub fn branch_from_ref(git_ref: &str) -> String {
    let trimmed = git_ref.trim();
    let name = trimmed
        .strip_prefix("refs/heads/")
        .or_else(|| trimmed.rsplit('/').next())
        .unwrap_or(trimmed);
    if name.is_empty() {
        "main".to_string()
    } else {
        name.to_string()
    }
}

/// Errors for commit ids
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Wrong length
    #[error("commit id must be 7..=64 hex characters, got {0}")]
    InvalidLength(usize),

    /// Non-hex character
    #[error("commit id contains non-hex character '{0}'")]
    InvalidCharacter(char),
}
