//! Core types for the pipeline
//!
//! - [`ChangeEvent`]: the merge notification that triggers a run
//! - [`Analysis`] / [`AnalysisResult`]: collaborator output and the
//!   persisted payload built from it
//! - [`AssetOutcome`] / [`RunReport`]: what a run did, and its exit code

use chrono::{DateTime, Utc};
use ingest_asset::{branch_from_ref, AssetKey, CommitSha, ContentHash};
use ingest_store::{Label, ObjectKey, ResultStatus, RunId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Merged pull request notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Merge commit
    pub commit: CommitSha,
    /// Commit the change set is diffed against; defaults to the first parent
    #[serde(default)]
    pub base: Option<CommitSha>,
    /// Target branch name
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Changed paths, when the trigger supplies them
    #[serde(default)]
    pub paths: Option<Vec<String>>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl ChangeEvent {
    #[inline]
    #[must_use]
    pub fn new(commit: CommitSha) -> Self {
        Self {
            commit,
            base: None,
            branch: default_branch(),
            paths: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_base(mut self, base: CommitSha) -> Self {
        self.base = Some(base);
        self
    }

    #[inline]
    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Derive the branch from a git ref such as `refs/heads/main`
    #[inline]
    #[must_use]
    pub fn with_ref(mut self, git_ref: &str) -> Self {
        self.branch = branch_from_ref(git_ref);
        self
    }

    #[must_use]
    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = Some(paths.into_iter().map(Into::into).collect());
        self
    }
}

/// What the analysis collaborator returns for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Arbitrary structured fields
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Summary labels
    #[serde(default)]
    pub labels: Vec<Label>,
}

impl Analysis {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, confidence: f64) -> Self {
        self.labels.push(Label::new(name, confidence));
        self
    }
}

/// Persisted payload for one asset at one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub key: AssetKey,
    pub commit: CommitSha,
    pub status: ResultStatus,
    pub fields: BTreeMap<String, serde_json::Value>,
    pub labels: Vec<Label>,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub analyzed_at: DateTime<Utc>,
    /// Analyzer that produced the result
    pub analyzer: String,
}

impl AnalysisResult {
    /// Successful result built from collaborator output
    #[must_use]
    pub fn success(
        key: AssetKey,
        commit: CommitSha,
        analysis: Analysis,
        bytes: &[u8],
        analyzer: &str,
    ) -> Self {
        Self {
            key,
            commit,
            status: ResultStatus::Success,
            fields: analysis.fields,
            labels: analysis.labels,
            content_hash: ContentHash::compute(bytes),
            size_bytes: bytes.len() as u64,
            analyzed_at: Utc::now(),
            analyzer: analyzer.to_string(),
        }
    }

    /// Scalar fields, which are copied into the lookup table row
    #[must_use]
    pub fn summary_fields(&self) -> BTreeMap<String, serde_json::Value> {
        self.fields
            .iter()
            .filter(|(_, v)| !(v.is_array() || v.is_object() || v.is_null()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Why an asset was not processed by this run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// A previous run already succeeded for this commit
    AlreadyProcessed,
    /// Another live run holds the claim
    InProgress { holder: RunId },
    /// File absent from the checkout
    Missing,
    /// Lease ran out and another run took the claim over; this run's
    /// result was discarded
    ClaimLost,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyProcessed => f.write_str("already processed"),
            Self::InProgress { holder } => write!(f, "in progress by run {holder}"),
            Self::Missing => f.write_str("missing from checkout"),
            Self::ClaimLost => f.write_str("claim taken over by another run"),
        }
    }
}

/// Why an asset was refused before analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    TooLarge { size: u64, limit: u64 },
}

impl Display for RejectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { size, limit } => write!(f, "too large ({size} > {limit} bytes)"),
        }
    }
}

/// Final state of one asset in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssetOutcome {
    Written { object_key: ObjectKey },
    Skipped(SkipReason),
    Rejected(RejectReason),
    Failed { error: String },
}

impl AssetOutcome {
    #[inline]
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl Display for AssetOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Written { object_key } => write!(f, "written to {object_key}"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::Failed { error } => write!(f, "failed: {error}"),
        }
    }
}

/// Outcome of one asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetReport {
    pub key: AssetKey,
    pub outcome: AssetOutcome,
    /// Analysis attempts made by this run
    pub attempts: u32,
    pub elapsed_ms: u64,
}

/// Per-outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub written: usize,
    pub skipped: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Everything a run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub commit: CommitSha,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Sorted by asset key
    pub assets: Vec<AssetReport>,
}

impl RunReport {
    #[must_use]
    pub fn counts(&self) -> OutcomeCounts {
        self.assets
            .iter()
            .fold(OutcomeCounts::default(), |mut acc, a| {
                match a.outcome {
                    AssetOutcome::Written { .. } => acc.written += 1,
                    AssetOutcome::Skipped(_) => acc.skipped += 1,
                    AssetOutcome::Rejected(_) => acc.rejected += 1,
                    AssetOutcome::Failed { .. } => acc.failed += 1,
                }
                acc
            })
    }

    /// Check that no asset permanently failed
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.assets.iter().any(|a| a.outcome.is_failure())
    }

    /// Process exit code: 0 when nothing failed, 1 otherwise
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// Outcome for `key`, if it was part of the run
    #[must_use]
    pub fn outcome(&self, key: &AssetKey) -> Option<&AssetOutcome> {
        self.assets
            .binary_search_by(|a| a.key.cmp(key))
            .ok()
            .map(|i| &self.assets[i].outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(p: &str) -> AssetKey {
        AssetKey::new(p).unwrap()
    }

    fn report(outcomes: Vec<(&str, AssetOutcome)>) -> RunReport {
        RunReport {
            run_id: RunId::new(),
            commit: CommitSha::new("abcdef1").unwrap(),
            branch: "main".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            assets: outcomes
                .into_iter()
                .map(|(p, outcome)| AssetReport {
                    key: key(p),
                    outcome,
                    attempts: 1,
                    elapsed_ms: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn event_from_json_with_defaults() {
        let event: ChangeEvent =
            serde_json::from_str(r#"{"commit":"ABCDEF1234","paths":["images/a.png"]}"#).unwrap();
        assert_eq!(event.commit.as_str(), "abcdef1234");
        assert_eq!(event.branch, "main");
        assert_eq!(event.paths.as_deref(), Some(&["images/a.png".to_string()][..]));
    }

    #[test]
    fn event_branch_from_ref() {
        let event = ChangeEvent::new(CommitSha::new("abcdef1").unwrap()).with_ref("refs/heads/dev");
        assert_eq!(event.branch, "dev");
    }

    #[test]
    fn rejected_and_skipped_do_not_fail_run() {
        let r = report(vec![
            ("images/a.png", AssetOutcome::Skipped(SkipReason::AlreadyProcessed)),
            (
                "images/b.png",
                AssetOutcome::Rejected(RejectReason::TooLarge { size: 10, limit: 5 }),
            ),
        ]);
        assert!(r.is_success());
        assert_eq!(r.exit_code(), 0);
    }

    #[test]
    fn any_failure_sets_exit_code() {
        let r = report(vec![
            (
                "images/a.png",
                AssetOutcome::Written {
                    object_key: ObjectKey::new("analysis/x/abcdef1.json").unwrap(),
                },
            ),
            ("images/b.png", AssetOutcome::Failed { error: "boom".into() }),
        ]);
        assert_eq!(r.exit_code(), 1);
        let counts = r.counts();
        assert_eq!((counts.written, counts.failed), (1, 1));
        assert!(r.outcome(&key("images/b.png")).unwrap().is_failure());
        assert!(r.outcome(&key("images/z.png")).is_none());
    }

    #[test]
    fn summary_fields_keep_scalars() {
        let analysis = Analysis::new()
            .with_field("width", 10)
            .with_field("format", "png")
            .with_field("histogram", serde_json::json!([1, 2, 3]));
        let result = AnalysisResult::success(
            key("images/a.png"),
            CommitSha::new("abcdef1").unwrap(),
            analysis,
            b"bytes",
            "test",
        );
        let summary = result.summary_fields();
        assert_eq!(summary.len(), 2);
        assert!(summary.contains_key("width"));
        assert_eq!(result.size_bytes, 5);
    }
}
