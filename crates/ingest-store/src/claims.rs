//! Claim table
//!
//! [`ClaimStore`] is the only shared mutable resource between pipeline
//! runs. Every mutation is a conditional write: `try_claim` succeeds only if
//! no live claim or success exists, and `complete` / `fail` / `release`
//! succeed only for the current holder.

use crate::error::{ClaimError, StoreError};
use crate::record::{ClaimDecision, ClaimKey, ProcessingRecord, RecordState, RunId};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

/// Shared claim table with atomic conditional writes
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Reserve `key` for `run`
    ///
    /// Succeeds when no record exists, the previous attempt failed, or the
    /// current holder's lease expired.
    ///
    /// # Errors
    /// [`ClaimError::Conflict`] when a live claim or a success exists
    async fn try_claim(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError>;

    /// Mark a held claim `Succeeded`
    async fn complete(&self, key: &ClaimKey, run: RunId) -> Result<ProcessingRecord, ClaimError>;

    /// Mark a held claim `Failed` with a reason
    async fn fail(
        &self,
        key: &ClaimKey,
        run: RunId,
        reason: &str,
    ) -> Result<ProcessingRecord, ClaimError>;

    /// Extend a held claim's lease; confirms `run` still holds it
    ///
    /// # Errors
    /// [`ClaimError::NotHolder`] once another run has taken the claim over
    async fn renew(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError>;

    /// Drop a held claim so the pair is unclaimed again
    async fn release(&self, key: &ClaimKey, run: RunId) -> Result<(), ClaimError>;

    /// Current record for `key`
    async fn get(&self, key: &ClaimKey) -> Result<Option<ProcessingRecord>, StoreError>;

    /// All records
    async fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError>;
}

/// In-process claim table
///
/// Conditional writes hold the `DashMap` shard lock for the key, so
/// concurrent callers sharing one instance are serialized per key.
#[derive(Debug, Default)]
pub struct MemoryClaimStore {
    records: DashMap<ClaimKey, ProcessingRecord>,
}

impl MemoryClaimStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn settle(
        &self,
        key: &ClaimKey,
        run: RunId,
        to: RecordState,
        error: Option<String>,
    ) -> Result<ProcessingRecord, ClaimError> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| ClaimError::NotHolder {
                key: key.clone(),
                run,
            })?;
        entry.settle(run, to, error, Utc::now())?;
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl ClaimStore for MemoryClaimStore {
    async fn try_claim(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError> {
        let now = Utc::now();
        match self.records.entry(key.clone()) {
            Entry::Vacant(slot) => {
                let record = ProcessingRecord::claimed(key.clone(), run, lease, now);
                slot.insert(record.clone());
                Ok(record)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                match record.decide(now) {
                    ClaimDecision::Conflict => Err(record.conflict()),
                    ClaimDecision::Fresh | ClaimDecision::Retry | ClaimDecision::Takeover => {
                        record.reclaim(run, lease, now)?;
                        Ok(record.clone())
                    }
                }
            }
        }
    }

    async fn complete(&self, key: &ClaimKey, run: RunId) -> Result<ProcessingRecord, ClaimError> {
        self.settle(key, run, RecordState::Succeeded, None)
    }

    async fn fail(
        &self,
        key: &ClaimKey,
        run: RunId,
        reason: &str,
    ) -> Result<ProcessingRecord, ClaimError> {
        self.settle(key, run, RecordState::Failed, Some(reason.to_string()))
    }

    async fn renew(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError> {
        let mut entry = self
            .records
            .get_mut(key)
            .ok_or_else(|| ClaimError::NotHolder {
                key: key.clone(),
                run,
            })?;
        entry.renew(run, lease, Utc::now())?;
        Ok(entry.value().clone())
    }

    async fn release(&self, key: &ClaimKey, run: RunId) -> Result<(), ClaimError> {
        match self.records.entry(key.clone()) {
            Entry::Vacant(_) => Err(ClaimError::NotHolder {
                key: key.clone(),
                run,
            }),
            Entry::Occupied(slot) => {
                slot.get().ensure_releasable(run)?;
                slot.remove();
                Ok(())
            }
        }
    }

    async fn get(&self, key: &ClaimKey) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let mut out: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_asset::{AssetKey, CommitSha};
    use std::sync::Arc;

    const LEASE: Duration = Duration::from_secs(600);

    fn key(path: &str) -> ClaimKey {
        ClaimKey::new(
            AssetKey::new(path).unwrap(),
            CommitSha::new("feedbeef00").unwrap(),
        )
    }

    #[tokio::test]
    async fn claim_then_conflict() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");

        let first = store.try_claim(&k, RunId::new(), LEASE).await.unwrap();
        assert_eq!(first.state, RecordState::Claimed);

        let err = store.try_claim(&k, RunId::new(), LEASE).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn succeeded_is_terminal() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");
        let run = RunId::new();

        store.try_claim(&k, run, LEASE).await.unwrap();
        let done = store.complete(&k, run).await.unwrap();
        assert_eq!(done.state, RecordState::Succeeded);

        // Even with an expired lease a success cannot be reclaimed
        let err = store
            .try_claim(&k, RunId::new(), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::Conflict {
                state: RecordState::Succeeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn failed_can_be_retried() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");
        let run = RunId::new();

        store.try_claim(&k, run, LEASE).await.unwrap();
        store.fail(&k, run, "decoder crashed").await.unwrap();

        let retry = RunId::new();
        let rec = store.try_claim(&k, retry, LEASE).await.unwrap();
        assert_eq!(rec.holder, retry);
        assert_eq!(rec.attempts, 2);
        assert_eq!(rec.last_error.as_deref(), Some("decoder crashed"));
    }

    #[tokio::test]
    async fn release_removes_record() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");
        let run = RunId::new();

        store.try_claim(&k, run, LEASE).await.unwrap();
        assert!(store.release(&k, RunId::new()).await.is_err());
        store.release(&k, run).await.unwrap();
        assert!(store.get(&k).await.unwrap().is_none());
        assert!(store.release(&k, run).await.is_err());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_and_old_holder_fenced() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");
        let crashed = RunId::new();
        let rescuer = RunId::new();

        store.try_claim(&k, crashed, Duration::ZERO).await.unwrap();
        store.try_claim(&k, rescuer, LEASE).await.unwrap();

        let err = store.complete(&k, crashed).await.unwrap_err();
        assert!(matches!(err, ClaimError::NotHolder { .. }));
        assert!(store.complete(&k, rescuer).await.is_ok());
    }

    #[tokio::test]
    async fn renew_extends_lease_until_taken_over() {
        let store = MemoryClaimStore::new();
        let k = key("images/cat.png");
        let slow = RunId::new();

        store.try_claim(&k, slow, Duration::ZERO).await.unwrap();
        // Expired but not yet taken over: the holder may still renew
        let renewed = store.renew(&k, slow, LEASE).await.unwrap();
        assert!(!renewed.lease_expired(Utc::now()));
        assert!(store.try_claim(&k, RunId::new(), LEASE).await.unwrap_err().is_conflict());

        store.renew(&k, slow, Duration::ZERO).await.unwrap();
        store.try_claim(&k, RunId::new(), LEASE).await.unwrap();
        assert!(matches!(
            store.renew(&k, slow, LEASE).await,
            Err(ClaimError::NotHolder { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_claims_have_single_winner() {
        let store = Arc::new(MemoryClaimStore::new());
        let k = key("images/cat.png");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                store.try_claim(&k, RunId::new(), LEASE).await
            }));
        }

        let mut winners = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn list_is_sorted() {
        let store = MemoryClaimStore::new();
        for p in ["images/z.png", "images/a.png", "images/m.png"] {
            store.try_claim(&key(p), RunId::new(), LEASE).await.unwrap();
        }
        let listed: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key.asset.to_string())
            .collect();
        assert_eq!(listed, vec!["images/a.png", "images/m.png", "images/z.png"]);
        assert_eq!(store.len(), 3);
    }
}
