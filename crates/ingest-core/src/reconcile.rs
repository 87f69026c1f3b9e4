//! Reconciliation sweep
//!
//! Repairs what crashed runs leave behind:
//!
//! 1. Expired claims whose table row already points at their commit's
//!    object are promoted to `Succeeded` (crash after the row write).
//! 2. Other expired claims are released.
//! 3. Objects under the result prefix that no succeeded record, live claim
//!    or table row refers to are deleted.
//!
//! The sweep acts through the same conditional claim writes as a run: it
//! takes over an expired claim under its own [`RunId`] before settling it.

use crate::error::PipelineError;
use chrono::Utc;
use ingest_store::{
    ClaimError, ClaimKey, ClaimStore, ObjectKey, ObjectStore, RecordState, ResultTable, RunId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Lease the sweep holds while settling a taken-over claim
const SWEEP_LEASE: Duration = Duration::from_secs(60);

/// What a sweep changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub promoted: Vec<ClaimKey>,
    pub released: Vec<ClaimKey>,
    pub orphans_deleted: Vec<ObjectKey>,
    /// Claims another process touched during the sweep
    pub contended: usize,
}

impl SweepReport {
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.promoted.is_empty() && self.released.is_empty() && self.orphans_deleted.is_empty()
    }
}

/// Crash-recovery sweep over the shared stores
#[derive(Clone)]
pub struct Reconciler {
    claims: Arc<dyn ClaimStore>,
    objects: Arc<dyn ObjectStore>,
    table: Arc<dyn ResultTable>,
    object_prefix: String,
    run: RunId,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("object_prefix", &self.object_prefix)
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        objects: Arc<dyn ObjectStore>,
        table: Arc<dyn ResultTable>,
        object_prefix: impl Into<String>,
    ) -> Self {
        Self {
            claims,
            objects,
            table,
            object_prefix: object_prefix.into(),
            run: RunId::new(),
        }
    }

    /// Run one sweep
    ///
    /// # Errors
    /// [`PipelineError::Store`] if a store cannot be listed or updated
    pub async fn sweep(&self) -> Result<SweepReport, PipelineError> {
        let mut report = SweepReport::default();
        let now = Utc::now();

        for record in self.claims.list().await? {
            if !record.lease_expired(now) {
                continue;
            }
            let key = record.key;
            let committed = self.row_points_at_commit(&key).await?;

            match self.claims.try_claim(&key, self.run, SWEEP_LEASE).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    report.contended += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let settled = if committed {
                self.claims.complete(&key, self.run).await.map(|_| true)
            } else {
                self.claims.release(&key, self.run).await.map(|()| false)
            };
            match settled {
                Ok(true) => {
                    tracing::info!(claim = %key, "promoted crash-interrupted write");
                    report.promoted.push(key);
                }
                Ok(false) => {
                    tracing::info!(claim = %key, "released expired claim");
                    report.released.push(key);
                }
                Err(ClaimError::NotHolder { .. }) => report.contended += 1,
                Err(e) => return Err(e.into()),
            }
        }

        report.orphans_deleted = self.delete_orphans().await?;
        tracing::info!(
            promoted = report.promoted.len(),
            released = report.released.len(),
            orphans = report.orphans_deleted.len(),
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn row_points_at_commit(&self, key: &ClaimKey) -> Result<bool, PipelineError> {
        let Some(row) = self.table.get(&key.asset).await? else {
            return Ok(false);
        };
        let expected = self.result_key(key)?;
        Ok(row.commit == key.commit && row.object_key.as_ref() == Some(&expected))
    }

    fn result_key(&self, key: &ClaimKey) -> Result<ObjectKey, PipelineError> {
        Ok(ObjectKey::for_result(&self.object_prefix, &key.asset, &key.commit)?)
    }

    async fn delete_orphans(&self) -> Result<Vec<ObjectKey>, PipelineError> {
        let now = Utc::now();
        let mut referenced = BTreeSet::new();

        for record in self.claims.list().await? {
            let live = record.state == RecordState::Claimed && !record.lease_expired(now);
            if record.state == RecordState::Succeeded || live {
                referenced.insert(self.result_key(&record.key)?);
            }
        }
        for row in self.table.scan().await? {
            if let Some(object_key) = row.object_key {
                referenced.insert(object_key);
            }
        }

        let mut deleted = Vec::new();
        for object_key in self.objects.list(&self.object_prefix).await? {
            if referenced.contains(&object_key) {
                continue;
            }
            if self.objects.delete(&object_key).await? {
                tracing::info!(object = %object_key, "deleted orphan object");
                deleted.push(object_key);
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_asset::{AssetKey, CommitSha};
    use ingest_store::{
        MemoryClaimStore, MemoryObjectStore, MemoryResultTable, ResultStatus, TableRow,
    };
    use std::collections::BTreeMap;

    struct Fixture {
        claims: Arc<MemoryClaimStore>,
        objects: Arc<MemoryObjectStore>,
        table: Arc<MemoryResultTable>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let claims = Arc::new(MemoryClaimStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let table = Arc::new(MemoryResultTable::new());
        let reconciler = Reconciler::new(claims.clone(), objects.clone(), table.clone(), "analysis/");
        Fixture {
            claims,
            objects,
            table,
            reconciler,
        }
    }

    fn claim_key(path: &str) -> ClaimKey {
        ClaimKey::new(AssetKey::new(path).unwrap(), CommitSha::new("abcdef1").unwrap())
    }

    fn row(key: &ClaimKey, object_key: Option<ObjectKey>) -> TableRow {
        TableRow {
            key: key.asset.clone(),
            commit: key.commit.clone(),
            branch: "main".into(),
            status: ResultStatus::Success,
            labels: Vec::new(),
            summary: BTreeMap::new(),
            object_key,
            content_hash: None,
            size_bytes: None,
            error: None,
            analyzed_at: Utc::now(),
            run_id: RunId::new(),
        }
    }

    fn object_for(key: &ClaimKey) -> ObjectKey {
        ObjectKey::for_result("analysis/", &key.asset, &key.commit).unwrap()
    }

    #[tokio::test]
    async fn promotes_expired_claim_with_committed_row() {
        let f = fixture();
        let key = claim_key("images/cat.png");
        f.claims.try_claim(&key, RunId::new(), Duration::ZERO).await.unwrap();
        f.objects.put(&object_for(&key), b"{}".to_vec()).await.unwrap();
        f.table.upsert(row(&key, Some(object_for(&key)))).await.unwrap();

        let report = f.reconciler.sweep().await.unwrap();

        assert_eq!(report.promoted, vec![key.clone()]);
        let record = f.claims.get(&key).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Succeeded);
        assert!(f.objects.get(&object_for(&key)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn releases_expired_claim_and_deletes_its_orphan() {
        let f = fixture();
        let key = claim_key("images/cat.png");
        f.claims.try_claim(&key, RunId::new(), Duration::ZERO).await.unwrap();
        f.objects.put(&object_for(&key), b"{}".to_vec()).await.unwrap();

        let report = f.reconciler.sweep().await.unwrap();

        assert_eq!(report.released, vec![key.clone()]);
        assert_eq!(report.orphans_deleted, vec![object_for(&key)]);
        assert!(f.claims.get(&key).await.unwrap().is_none());
        assert!(f.objects.is_empty());
    }

    #[tokio::test]
    async fn live_claims_and_referenced_objects_survive() {
        let f = fixture();
        let live = claim_key("images/live.png");
        let done = claim_key("images/done.png");
        let run = RunId::new();

        f.claims.try_claim(&live, RunId::new(), Duration::from_secs(600)).await.unwrap();
        f.objects.put(&object_for(&live), b"{}".to_vec()).await.unwrap();

        f.claims.try_claim(&done, run, Duration::from_secs(600)).await.unwrap();
        f.claims.complete(&done, run).await.unwrap();
        f.objects.put(&object_for(&done), b"{}".to_vec()).await.unwrap();

        let unrelated = ObjectKey::new("elsewhere/keep.json").unwrap();
        f.objects.put(&unrelated, b"{}".to_vec()).await.unwrap();

        let report = f.reconciler.sweep().await.unwrap();
        assert!(report.is_clean());
        assert_eq!(f.objects.len(), 3);
    }

    #[tokio::test]
    async fn failed_records_do_not_protect_objects() {
        let f = fixture();
        let key = claim_key("images/cat.png");
        let run = RunId::new();
        f.claims.try_claim(&key, run, Duration::from_secs(600)).await.unwrap();
        f.claims.fail(&key, run, "boom").await.unwrap();
        f.objects.put(&object_for(&key), b"{}".to_vec()).await.unwrap();

        let report = f.reconciler.sweep().await.unwrap();
        assert_eq!(report.orphans_deleted.len(), 1);
        // Failed record itself is left for a future retry
        assert_eq!(
            f.claims.get(&key).await.unwrap().unwrap().state,
            RecordState::Failed
        );
    }
}
