//! Result persistence
//!
//! A result is visible once its table row exists. The writer therefore
//! stores the payload object first and the row last; if the row cannot be
//! written the object is deleted again. Crashes between the two steps leave
//! at most an orphan object, which the reconciliation sweep collects.

use crate::config::RetryPolicy;
use crate::error::WriteError;
use crate::retry::retry;
use crate::types::AnalysisResult;
use chrono::Utc;
use ingest_asset::{AssetKey, CommitSha};
use ingest_store::{ObjectKey, ObjectStore, ResultStatus, ResultTable, RunId, TableRow};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Writes results to the object store and lookup table
#[derive(Clone)]
pub struct ResultWriter {
    objects: Arc<dyn ObjectStore>,
    table: Arc<dyn ResultTable>,
    object_prefix: String,
    branch: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ResultWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultWriter")
            .field("object_prefix", &self.object_prefix)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl ResultWriter {
    #[must_use]
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        table: Arc<dyn ResultTable>,
        object_prefix: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            table,
            object_prefix: object_prefix.into(),
            branch: branch.into(),
            retry: RetryPolicy::default(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Object key a result for `asset` at `commit` is stored under
    ///
    /// # Errors
    /// [`WriteError::Key`] if the configured prefix is not a relative path
    pub fn object_key(&self, asset: &AssetKey, commit: &CommitSha) -> Result<ObjectKey, WriteError> {
        ObjectKey::for_result(&self.object_prefix, asset, commit).map_err(WriteError::Key)
    }

    /// Persist `result`: payload object, then table row
    ///
    /// # Errors
    /// [`WriteError`] after retries; on error the new row is not visible and
    /// an object created by this call is deleted again (best-effort)
    pub async fn write(&self, result: &AnalysisResult, run: RunId) -> Result<ObjectKey, WriteError> {
        let object_key = self.object_key(&result.key, &result.commit)?;
        let body = serde_json::to_vec_pretty(result)?;

        // Rollback must never remove a payload some other run stored
        let preexisting = self
            .objects
            .get(&object_key)
            .await
            .map_err(|source| WriteError::Object {
                key: object_key.clone(),
                source,
            })?
            .is_some();

        retry(&self.retry, "object put", |_| {
            let body = body.clone();
            let object_key = &object_key;
            async move {
                self.objects
                    .put(object_key, body)
                    .await
                    .map_err(|source| WriteError::Object {
                        key: object_key.clone(),
                        source,
                    })
            }
        })
        .await
        .result?;

        let row = TableRow {
            key: result.key.clone(),
            commit: result.commit.clone(),
            branch: self.branch.clone(),
            status: ResultStatus::Success,
            labels: result.labels.clone(),
            summary: result.summary_fields(),
            object_key: Some(object_key.clone()),
            content_hash: Some(result.content_hash),
            size_bytes: Some(result.size_bytes),
            error: None,
            analyzed_at: result.analyzed_at,
            run_id: run,
        };

        if let Err(e) = self.upsert(row).await {
            if preexisting {
                tracing::warn!(object = %object_key, "table write failed; object predates this write, kept");
                return Err(e);
            }
            match self.objects.delete(&object_key).await {
                Ok(_) => tracing::warn!(object = %object_key, "rolled back object after table failure"),
                Err(del) => tracing::error!(
                    object = %object_key,
                    error = %del,
                    "object rollback failed; left for reconciliation"
                ),
            }
            return Err(e);
        }

        tracing::info!(asset = %result.key, object = %object_key, "result written");
        Ok(object_key)
    }

    /// Record a permanent analysis failure in the table (no object)
    ///
    /// # Errors
    /// [`WriteError::Table`] after retries
    pub async fn write_failure(
        &self,
        asset: &AssetKey,
        commit: &CommitSha,
        error: &str,
        run: RunId,
    ) -> Result<(), WriteError> {
        let row = TableRow {
            key: asset.clone(),
            commit: commit.clone(),
            branch: self.branch.clone(),
            status: ResultStatus::Failure,
            labels: Vec::new(),
            summary: BTreeMap::new(),
            object_key: None,
            content_hash: None,
            size_bytes: None,
            error: Some(error.to_string()),
            analyzed_at: Utc::now(),
            run_id: run,
        };
        self.upsert(row).await
    }

    async fn upsert(&self, row: TableRow) -> Result<(), WriteError> {
        retry(&self.retry, "table upsert", |_| {
            let row = row.clone();
            async move {
                let key = row.key.clone();
                self.table
                    .upsert(row)
                    .await
                    .map_err(|source| WriteError::Table { key, source })
            }
        })
        .await
        .result
    }
}
