//! Store bundle shared by runs, sweeps and status queries

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use chrono::Utc;
use ingest_store::{
    ClaimStore, FsClaimStore, FsObjectStore, FsResultTable, MemoryClaimStore, MemoryObjectStore,
    MemoryResultTable, ObjectStore, RecordState, ResultStatus, ResultTable,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Claim table, object store and lookup table used together
#[derive(Clone)]
pub struct Stores {
    pub claims: Arc<dyn ClaimStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub table: Arc<dyn ResultTable>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

impl Stores {
    #[inline]
    #[must_use]
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        objects: Arc<dyn ObjectStore>,
        table: Arc<dyn ResultTable>,
    ) -> Self {
        Self {
            claims,
            objects,
            table,
        }
    }

    /// Fresh in-process stores
    #[must_use]
    pub fn memory() -> Self {
        Self::new(
            Arc::new(MemoryClaimStore::new()),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryResultTable::new()),
        )
    }

    /// Filesystem stores under `config.store_root`:
    ///
    /// ```text
    /// <root>/objects/<bucket>/...
    /// <root>/tables/<table>/rows/
    /// <root>/tables/<table>/claims/
    /// ```
    #[must_use]
    pub fn filesystem(config: &PipelineConfig) -> Self {
        let root = &config.store_root;
        let table_dir = root.join("tables").join(&config.table);
        Self::new(
            Arc::new(FsClaimStore::new(table_dir.join("claims"))),
            Arc::new(FsObjectStore::new(root.join("objects").join(&config.bucket))),
            Arc::new(FsResultTable::new(table_dir.join("rows"))),
        )
    }

    /// Summarize what the stores hold
    ///
    /// # Errors
    /// [`PipelineError::Store`] if a store cannot be listed
    pub async fn status(&self, object_prefix: &str) -> Result<StoreStatus, PipelineError> {
        let now = Utc::now();
        let mut status = StoreStatus::default();

        for record in self.claims.list().await? {
            match record.state {
                RecordState::Claimed if record.lease_expired(now) => status.expired += 1,
                RecordState::Claimed => status.claimed += 1,
                RecordState::Succeeded => status.succeeded += 1,
                RecordState::Failed => status.failed += 1,
            }
        }
        for row in self.table.scan().await? {
            match row.status {
                ResultStatus::Success => status.rows_success += 1,
                ResultStatus::Failure => status.rows_failure += 1,
            }
        }
        status.objects = self.objects.list(object_prefix).await?.len();
        Ok(status)
    }
}

/// Counts reported by `status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    /// Live claims
    pub claimed: usize,
    /// Claims past their lease
    pub expired: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_success: usize,
    pub rows_failure: usize,
    pub objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_asset::{AssetKey, CommitSha};
    use ingest_store::{ClaimKey, ObjectKey, RunId};
    use std::time::Duration;

    #[tokio::test]
    async fn status_counts_by_state() {
        let stores = Stores::memory();
        let commit = CommitSha::new("abcdef1").unwrap();
        let key = |p: &str| ClaimKey::new(AssetKey::new(p).unwrap(), commit.clone());
        let run = RunId::new();

        stores.claims.try_claim(&key("images/a.png"), run, Duration::from_secs(60)).await.unwrap();
        stores.claims.try_claim(&key("images/b.png"), run, Duration::ZERO).await.unwrap();
        stores.claims.try_claim(&key("images/c.png"), run, Duration::from_secs(60)).await.unwrap();
        stores.claims.complete(&key("images/c.png"), run).await.unwrap();
        stores
            .objects
            .put(&ObjectKey::new("analysis/x/abcdef1.json").unwrap(), Vec::new())
            .await
            .unwrap();

        let status = stores.status("analysis/").await.unwrap();
        assert_eq!(
            status,
            StoreStatus {
                claimed: 1,
                expired: 1,
                succeeded: 1,
                objects: 1,
                ..StoreStatus::default()
            }
        );
    }

    #[tokio::test]
    async fn filesystem_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::new()
            .with_store_root(dir.path())
            .with_bucket("bkt")
            .with_table("tbl");
        let stores = Stores::filesystem(&config);
        stores
            .objects
            .put(&ObjectKey::new("analysis/k.json").unwrap(), b"{}".to_vec())
            .await
            .unwrap();

        assert!(dir.path().join("objects/bkt/analysis/k.json").is_file());
        assert_eq!(stores.status("").await.unwrap().objects, 1);
    }
}
