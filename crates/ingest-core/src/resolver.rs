//! Change-set resolution
//!
//! Turns a [`ChangeEvent`] into the sorted, de-duplicated list of image
//! assets under the watched prefix. Paths come from a [`DiffSource`]:
//! either the event itself ([`EventPaths`]) or a git diff of the merge
//! commit ([`GitDiffSource`]).

use crate::error::ResolutionError;
use crate::types::ChangeEvent;
use async_trait::async_trait;
use git2::{Delta, DiffOptions, Repository};
use ingest_asset::{AssetKey, CommitSha, ImageFilter};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Supplies the raw changed paths of an event
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Raw changed paths, before filtering
    async fn changed_paths(&self, event: &ChangeEvent) -> Result<Vec<String>, ResolutionError>;

    /// Full object id for `commit`; abbreviated ids cannot be expanded
    /// without a repository
    async fn full_commit(&self, commit: &CommitSha) -> Result<CommitSha, ResolutionError> {
        if commit.is_full() {
            Ok(commit.clone())
        } else {
            Err(ResolutionError::AbbreviatedCommit(commit.to_string()))
        }
    }
}

/// Uses the path list carried by the event
#[derive(Debug, Clone, Copy, Default)]
pub struct EventPaths;

#[async_trait]
impl DiffSource for EventPaths {
    async fn changed_paths(&self, event: &ChangeEvent) -> Result<Vec<String>, ResolutionError> {
        event
            .paths
            .clone()
            .ok_or_else(|| ResolutionError::MissingChangeSet(event.commit.to_string()))
    }
}

/// Diffs the merge commit against its base (or first parent) in a local
/// repository. An explicit path list on the event takes precedence.
#[derive(Debug, Clone)]
pub struct GitDiffSource {
    repo: PathBuf,
}

impl GitDiffSource {
    #[inline]
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }
}

#[async_trait]
impl DiffSource for GitDiffSource {
    async fn changed_paths(&self, event: &ChangeEvent) -> Result<Vec<String>, ResolutionError> {
        if let Some(paths) = &event.paths {
            return Ok(paths.clone());
        }

        let repo = self.repo.clone();
        let commit = event.commit.clone();
        let base = event.base.clone();
        tokio::task::spawn_blocking(move || diff_paths(&repo, &commit, base.as_ref()))
            .await
            .map_err(|e| ResolutionError::Task(e.to_string()))?
    }

    async fn full_commit(&self, commit: &CommitSha) -> Result<CommitSha, ResolutionError> {
        if commit.is_full() {
            return Ok(commit.clone());
        }
        let repo = self.repo.clone();
        let short = commit.clone();
        tokio::task::spawn_blocking(move || expand_commit(&repo, &short))
            .await
            .map_err(|e| ResolutionError::Task(e.to_string()))?
    }
}

fn open_repo(repo_path: &Path) -> Result<Repository, ResolutionError> {
    Repository::open(repo_path).map_err(|e| ResolutionError::Repository {
        path: repo_path.to_path_buf(),
        message: e.message().to_string(),
    })
}

fn expand_commit(repo_path: &Path, commit: &CommitSha) -> Result<CommitSha, ResolutionError> {
    let repo = open_repo(repo_path)?;
    let found = repo
        .revparse_single(commit.as_str())
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| ResolutionError::UnknownCommit(commit.to_string()))?;
    Ok(CommitSha::new(&found.id().to_string())?)
}

fn diff_paths(
    repo_path: &Path,
    commit: &CommitSha,
    base: Option<&CommitSha>,
) -> Result<Vec<String>, ResolutionError> {
    let repo = open_repo(repo_path)?;
    let diff_err = |e: git2::Error| ResolutionError::Diff(e.message().to_string());

    let find_commit = |sha: &CommitSha| {
        repo.revparse_single(sha.as_str())
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|_| ResolutionError::UnknownCommit(sha.to_string()))
    };

    let head = find_commit(commit)?;
    let new_tree = head.tree().map_err(diff_err)?;
    let old_tree = match base {
        Some(base) => Some(find_commit(base)?.tree().map_err(diff_err)?),
        // Root commit: everything in the tree is new
        None if head.parent_count() == 0 => None,
        None => Some(head.parent(0).and_then(|p| p.tree()).map_err(diff_err)?),
    };

    let mut opts = DiffOptions::new();
    opts.ignore_filemode(true);
    let mut diff = repo
        .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))
        .map_err(diff_err)?;
    diff.find_similar(None).map_err(diff_err)?;

    let paths = diff
        .deltas()
        .filter(|d| d.status() != Delta::Deleted)
        .filter_map(|d| d.new_file().path().and_then(Path::to_str).map(str::to_string))
        .collect::<Vec<_>>();

    tracing::debug!(commit = %commit, changed = paths.len(), "git diff resolved");
    Ok(paths)
}

/// Resolves events to the image assets they touched
#[derive(Clone)]
pub struct ChangeSetResolver {
    filter: ImageFilter,
    source: Arc<dyn DiffSource>,
}

impl std::fmt::Debug for ChangeSetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSetResolver")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

impl ChangeSetResolver {
    #[inline]
    #[must_use]
    pub fn new(filter: ImageFilter, source: Arc<dyn DiffSource>) -> Self {
        Self { filter, source }
    }

    /// Resolver that only trusts the event's own path list
    #[inline]
    #[must_use]
    pub fn from_event_paths(filter: ImageFilter) -> Self {
        Self::new(filter, Arc::new(EventPaths))
    }

    #[inline]
    #[must_use]
    pub fn filter(&self) -> &ImageFilter {
        &self.filter
    }

    /// Distinct image assets changed by `event`, sorted by path
    ///
    /// # Errors
    /// [`ResolutionError`] if the diff cannot be retrieved
    pub async fn resolve(&self, event: &ChangeEvent) -> Result<Vec<AssetKey>, ResolutionError> {
        let paths = self.source.changed_paths(event).await?;
        let keys = self.select(&paths);
        tracing::info!(
            commit = %event.commit,
            changed = paths.len(),
            selected = keys.len(),
            "change set resolved"
        );
        Ok(keys)
    }

    /// Full commit id the event's results are keyed by
    ///
    /// # Errors
    /// [`ResolutionError::AbbreviatedCommit`] when the source cannot expand
    /// a short id, [`ResolutionError::UnknownCommit`] when the repository
    /// does not know it
    pub async fn full_commit(&self, event: &ChangeEvent) -> Result<CommitSha, ResolutionError> {
        let full = self.source.full_commit(&event.commit).await?;
        if full != event.commit {
            tracing::debug!(given = %event.commit, full = %full, "expanded abbreviated commit");
        }
        Ok(full)
    }

    /// Pure filtering step of [`Self::resolve`]
    #[must_use]
    pub fn select<S: AsRef<str>>(&self, paths: &[S]) -> Vec<AssetKey> {
        let mut keys = BTreeSet::new();
        for raw in paths {
            let raw = raw.as_ref();
            match AssetKey::new(raw) {
                Ok(key) if self.filter.matches(&key) => {
                    keys.insert(key);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(path = raw, error = %e, "dropping unnormalizable path"),
            }
        }
        keys.into_iter().collect()
    }
}
