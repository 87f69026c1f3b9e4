//! Processing records and their state machine
//!
//! A [`ProcessingRecord`] exists per (asset, commit) pair once some run has
//! claimed it. Absence of a record is the "unclaimed" state.
//!
//! ```text
//!  (absent) --claim--> Claimed --complete--> Succeeded
//!                        |  ^  \--fail-----> Failed --claim--> Claimed
//!                        |  '--takeover (lease expired)
//!                        '--release--> (absent)
//! ```

use crate::error::ClaimError;
use chrono::{DateTime, Utc};
use ingest_asset::{AssetKey, CommitSha, ContentHash};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::time::Duration;
use ulid::Ulid;

/// Unique pipeline run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Ulid);

impl RunId {
    /// Generate new run ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotency key: one asset at one commit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClaimKey {
    /// Claimed asset
    pub asset: AssetKey,
    /// Commit the asset is analyzed at
    pub commit: CommitSha,
}

impl ClaimKey {
    /// Key for `asset` at `commit`
    #[inline]
    #[must_use]
    pub fn new(asset: AssetKey, commit: CommitSha) -> Self {
        Self { asset, commit }
    }

    /// Filesystem-safe identifier for this pair
    #[must_use]
    pub fn storage_id(&self) -> String {
        ContentHash::compute_tagged(
            "image-ingest:claim:v1",
            &[self.asset.as_str(), self.commit.as_str()],
        )
        .to_string()
    }
}

impl Display for ClaimKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.asset, self.commit)
    }
}

/// Persisted claim state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    /// Reserved by a run that is analyzing / writing
    Claimed,
    /// Result durably written
    Succeeded,
    /// Permanently failed in some run; eligible for a later retry
    Failed,
}

impl Display for RecordState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Claimed => "claimed",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        })
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: RecordState) -> &'static [RecordState] {
    use RecordState::{Claimed, Failed, Succeeded};
    match from {
        Claimed => &[Claimed, Succeeded, Failed],
        Failed => &[Claimed],
        Succeeded => &[],
    }
}

/// Check a transition against the state machine
///
/// # Errors
/// Returns [`ClaimError::IllegalTransition`] when `to` is not reachable
pub fn validate_transition(
    key: &ClaimKey,
    from: RecordState,
    to: RecordState,
) -> Result<(), ClaimError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ClaimError::IllegalTransition {
            key: key.clone(),
            from,
            to,
        })
    }
}

/// Durable marker for one (asset, commit) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub key: ClaimKey,
    pub state: RecordState,
    /// Run that performed the latest transition
    pub holder: RunId,
    /// Number of claims taken on this pair, including the current one
    pub attempts: u32,
    pub claimed_at: DateTime<Utc>,
    /// A `Claimed` record past this instant may be taken over
    pub lease_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Outcome of evaluating a claim request against the current record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// No record yet
    Fresh,
    /// Previous attempt failed
    Retry,
    /// Holder's lease expired
    Takeover,
    /// Refuse
    Conflict,
}

impl ProcessingRecord {
    /// New `Claimed` record for a first attempt
    #[must_use]
    pub fn claimed(key: ClaimKey, run: RunId, lease: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key,
            state: RecordState::Claimed,
            holder: run,
            attempts: 1,
            claimed_at: now,
            lease_until: lease_deadline(now, lease),
            updated_at: now,
            last_error: None,
        }
    }

    /// Check if a `Claimed` record's lease ran out
    #[inline]
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Claimed && now >= self.lease_until
    }

    /// Decide whether `run` may claim over this record
    #[must_use]
    pub fn decide(&self, now: DateTime<Utc>) -> ClaimDecision {
        match self.state {
            RecordState::Succeeded => ClaimDecision::Conflict,
            RecordState::Failed => ClaimDecision::Retry,
            RecordState::Claimed if self.lease_expired(now) => ClaimDecision::Takeover,
            RecordState::Claimed => ClaimDecision::Conflict,
        }
    }

    /// Conflict error describing this record
    #[must_use]
    pub fn conflict(&self) -> ClaimError {
        ClaimError::Conflict {
            key: self.key.clone(),
            holder: self.holder,
            state: self.state,
        }
    }

    /// Re-claim a failed or expired record for `run`
    ///
    /// # Errors
    /// Returns [`ClaimError::IllegalTransition`] from `Succeeded`
    pub fn reclaim(
        &mut self,
        run: RunId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<(), ClaimError> {
        validate_transition(&self.key, self.state, RecordState::Claimed)?;
        self.state = RecordState::Claimed;
        self.holder = run;
        self.attempts = self.attempts.saturating_add(1);
        self.claimed_at = now;
        self.lease_until = lease_deadline(now, lease);
        self.updated_at = now;
        Ok(())
    }

    /// Extend a held claim's lease from `now`
    ///
    /// # Errors
    /// Same as [`Self::ensure_releasable`]
    pub fn renew(&mut self, run: RunId, lease: Duration, now: DateTime<Utc>) -> Result<(), ClaimError> {
        self.ensure_releasable(run)?;
        self.lease_until = lease_deadline(now, lease);
        self.updated_at = now;
        Ok(())
    }

    /// Move a held claim to `to` (`Succeeded` or `Failed`)
    ///
    /// # Errors
    /// - [`ClaimError::NotHolder`] if `run` is not the holder
    /// - [`ClaimError::IllegalTransition`] if not currently `Claimed`
    pub fn settle(
        &mut self,
        run: RunId,
        to: RecordState,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ClaimError> {
        self.ensure_holder(run)?;
        if self.state != RecordState::Claimed || to == RecordState::Claimed {
            return Err(ClaimError::IllegalTransition {
                key: self.key.clone(),
                from: self.state,
                to,
            });
        }
        validate_transition(&self.key, self.state, to)?;
        self.state = to;
        self.last_error = error;
        self.updated_at = now;
        Ok(())
    }

    /// Check that `run` holds this record in `Claimed` state (release guard)
    ///
    /// # Errors
    /// Same as [`Self::settle`]
    pub fn ensure_releasable(&self, run: RunId) -> Result<(), ClaimError> {
        self.ensure_holder(run)?;
        if self.state == RecordState::Claimed {
            Ok(())
        } else {
            Err(ClaimError::IllegalTransition {
                key: self.key.clone(),
                from: self.state,
                to: RecordState::Claimed,
            })
        }
    }

    fn ensure_holder(&self, run: RunId) -> Result<(), ClaimError> {
        if self.holder == run {
            Ok(())
        } else {
            Err(ClaimError::NotHolder {
                key: self.key.clone(),
                run,
            })
        }
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
