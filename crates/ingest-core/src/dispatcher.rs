//! Idempotent dispatch
//!
//! Before any analysis, the dispatcher reserves the (asset, commit) pair in
//! the shared [`ClaimStore`]. Only the run holding the reservation analyzes
//! and writes; everyone else skips.

use ingest_asset::{AssetKey, CommitSha};
use ingest_store::{ClaimError, ClaimKey, ClaimStore, ProcessingRecord, RunId};
use std::sync::Arc;
use std::time::Duration;

/// Proof that this run holds the claim on one pair
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a held claim must be completed, failed or released"]
pub struct ClaimTicket {
    pub key: ClaimKey,
    pub run: RunId,
    /// Attempts recorded on the pair, including this one
    pub attempts: u32,
}

/// Per-run claim front end
#[derive(Clone)]
pub struct Dispatcher {
    claims: Arc<dyn ClaimStore>,
    run: RunId,
    lease: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("run", &self.run)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[inline]
    #[must_use]
    pub fn new(claims: Arc<dyn ClaimStore>, run: RunId, lease: Duration) -> Self {
        Self { claims, run, lease }
    }

    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run
    }

    /// Reserve `asset` at `commit` for this run
    ///
    /// # Errors
    /// - [`ClaimError::Conflict`] when another run holds it or it already
    ///   succeeded; the caller skips the asset
    /// - [`ClaimError::Store`] when the claim table is unreachable
    pub async fn claim(&self, asset: &AssetKey, commit: &CommitSha) -> Result<ClaimTicket, ClaimError> {
        let key = ClaimKey::new(asset.clone(), commit.clone());
        let record = self.claims.try_claim(&key, self.run, self.lease).await?;
        if record.attempts > 1 {
            tracing::info!(claim = %key, attempts = record.attempts, "reclaimed for retry");
        } else {
            tracing::debug!(claim = %key, "claimed");
        }
        Ok(ClaimTicket {
            key,
            run: self.run,
            attempts: record.attempts,
        })
    }

    /// Confirm this run still holds the claim and restart its lease
    ///
    /// Called right before results are written, so a run whose lease ran
    /// out and was taken over never writes over the new holder.
    ///
    /// # Errors
    /// [`ClaimError::NotHolder`] if the claim was taken over meanwhile
    pub async fn confirm(&self, ticket: &ClaimTicket) -> Result<(), ClaimError> {
        self.claims.renew(&ticket.key, ticket.run, self.lease).await?;
        tracing::debug!(claim = %ticket.key, "claim confirmed");
        Ok(())
    }

    /// Mark the pair processed
    ///
    /// # Errors
    /// [`ClaimError::NotHolder`] if the claim was taken over meanwhile
    pub async fn complete(&self, ticket: ClaimTicket) -> Result<ProcessingRecord, ClaimError> {
        let record = self.claims.complete(&ticket.key, ticket.run).await?;
        tracing::debug!(claim = %ticket.key, "claim succeeded");
        Ok(record)
    }

    /// Mark the pair failed so a later run may retry it
    ///
    /// # Errors
    /// [`ClaimError::NotHolder`] if the claim was taken over meanwhile
    pub async fn fail(&self, ticket: ClaimTicket, reason: &str) -> Result<ProcessingRecord, ClaimError> {
        let record = self.claims.fail(&ticket.key, ticket.run, reason).await?;
        tracing::debug!(claim = %ticket.key, reason, "claim failed");
        Ok(record)
    }

    /// Drop the reservation; the pair is unclaimed again
    ///
    /// # Errors
    /// [`ClaimError::NotHolder`] if the claim was taken over meanwhile
    pub async fn release(&self, ticket: ClaimTicket) -> Result<(), ClaimError> {
        self.claims.release(&ticket.key, ticket.run).await?;
        tracing::debug!(claim = %ticket.key, "claim released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_store::{MemoryClaimStore, RecordState};

    const LEASE: Duration = Duration::from_secs(60);

    fn asset() -> AssetKey {
        AssetKey::new("images/cat.png").unwrap()
    }

    fn commit() -> CommitSha {
        CommitSha::new("abcdef1").unwrap()
    }

    #[tokio::test]
    async fn second_run_conflicts() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let a = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);
        let b = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);

        let ticket = a.claim(&asset(), &commit()).await.unwrap();
        assert_eq!(ticket.attempts, 1);
        assert!(b.claim(&asset(), &commit()).await.unwrap_err().is_conflict());

        let record = a.complete(ticket).await.unwrap();
        assert_eq!(record.state, RecordState::Succeeded);
        assert!(b.claim(&asset(), &commit()).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn failed_claim_is_retried_by_next_run() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let first = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);
        let ticket = first.claim(&asset(), &commit()).await.unwrap();
        first.fail(ticket, "timeout").await.unwrap();

        let second = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);
        let ticket = second.claim(&asset(), &commit()).await.unwrap();
        assert_eq!(ticket.attempts, 2);
        assert_eq!(ticket.run, second.run_id());
    }

    #[tokio::test]
    async fn release_makes_pair_claimable() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let d = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);
        let ticket = d.claim(&asset(), &commit()).await.unwrap();
        d.release(ticket).await.unwrap();

        let other = Dispatcher::new(store, RunId::new(), LEASE);
        assert_eq!(other.claim(&asset(), &commit()).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn confirm_fails_once_taken_over() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let stalled = Dispatcher::new(Arc::clone(&store), RunId::new(), Duration::ZERO);
        let ticket = stalled.claim(&asset(), &commit()).await.unwrap();
        stalled.confirm(&ticket).await.unwrap();

        let rescuer = Dispatcher::new(Arc::clone(&store), RunId::new(), LEASE);
        let _taken = rescuer.claim(&asset(), &commit()).await.unwrap();

        assert!(matches!(
            stalled.confirm(&ticket).await,
            Err(ClaimError::NotHolder { .. })
        ));
    }

    #[tokio::test]
    async fn other_commit_is_independent() {
        let store: Arc<dyn ClaimStore> = Arc::new(MemoryClaimStore::new());
        let d = Dispatcher::new(store, RunId::new(), LEASE);
        let _held = d.claim(&asset(), &commit()).await.unwrap();
        assert!(d
            .claim(&asset(), &CommitSha::new("1234567").unwrap())
            .await
            .is_ok());
    }
}
