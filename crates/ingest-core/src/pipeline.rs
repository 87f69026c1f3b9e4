//! Pipeline run
//!
//! One run per merge event:
//! 1. Resolve the event to image assets
//! 2. Claim each (asset, commit) pair; skip pairs another run owns
//! 3. Size-gate, read and analyze (timeout + retry) on the worker pool
//! 4. Write the result, then mark the claim succeeded
//!
//! Failures are confined to their asset. The [`RunReport`] carries every
//! outcome and the exit code.

use crate::analyzer::{Analyzer, AssetSource, ImageInput, ImageProbeAnalyzer, WorkspaceSource};
use crate::config::{PipelineConfig, RetryPolicy};
use crate::dispatcher::{ClaimTicket, Dispatcher};
use crate::error::{AnalysisError, PipelineError, SourceError};
use crate::reconcile::Reconciler;
use crate::resolver::{ChangeSetResolver, DiffSource, EventPaths};
use crate::retry::retry;
use crate::stores::Stores;
use crate::types::{
    AnalysisResult, AssetOutcome, AssetReport, ChangeEvent, RejectReason, RunReport, SkipReason,
};
use crate::worker_pool::{PoolStats, WorkerPool};
use crate::writer::ResultWriter;
use chrono::Utc;
use ingest_asset::{AssetKey, CommitSha};
use ingest_store::{ClaimError, RecordState, RunId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// The ingestion pipeline
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    stores: Stores,
    source: Arc<dyn AssetSource>,
    analyzer: Arc<dyn Analyzer>,
    resolver: ChangeSetResolver,
    pool: WorkerPool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("analyzer", &self.analyzer.name())
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create a pipeline with the workspace source, the image-probe analyzer
    /// and event-supplied paths
    ///
    /// # Errors
    /// [`PipelineError::Config`] if `config` fails validation
    pub fn new(config: PipelineConfig, stores: Stores) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            source: Arc::new(WorkspaceSource::new(config.workspace_root.clone())),
            analyzer: Arc::new(ImageProbeAnalyzer),
            resolver: ChangeSetResolver::new(config.image_filter(), Arc::new(EventPaths)),
            pool: WorkerPool::new(config.workers),
            config,
            stores,
        })
    }

    /// With analysis collaborator
    #[inline]
    #[must_use]
    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// With image byte source
    #[inline]
    #[must_use]
    pub fn with_source(mut self, source: Arc<dyn AssetSource>) -> Self {
        self.source = source;
        self
    }

    /// With diff source for events that carry no path list
    #[inline]
    #[must_use]
    pub fn with_diff_source(mut self, diff: Arc<dyn DiffSource>) -> Self {
        self.resolver = ChangeSetResolver::new(self.config.image_filter(), diff);
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Reconciler over this pipeline's stores
    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.stores.claims),
            Arc::clone(&self.stores.objects),
            Arc::clone(&self.stores.table),
            self.config.object_prefix.clone(),
        )
    }

    /// Worker pool statistics accumulated over all runs
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Process one merge event
    ///
    /// # Errors
    /// Only fatal errors: resolution failure or a worker panic. Per-asset
    /// failures are reported in the [`RunReport`].
    pub async fn run(&self, event: &ChangeEvent) -> Result<RunReport, PipelineError> {
        let run_id = RunId::new();
        let span = tracing::info_span!("run", run = %run_id, commit = %event.commit.short());
        self.run_inner(run_id, event).instrument(span).await
    }

    async fn run_inner(&self, run_id: RunId, event: &ChangeEvent) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        tracing::info!(branch = %event.branch, "pipeline run started");

        let commit = self.resolver.full_commit(event).await?;
        let keys = self.resolver.resolve(event).await?;
        let branch = if event.branch.trim().is_empty() {
            self.config.branch()
        } else {
            event.branch.clone()
        };

        let ctx = Arc::new(RunContext {
            run_id,
            commit: commit.clone(),
            dispatcher: Dispatcher::new(
                Arc::clone(&self.stores.claims),
                run_id,
                self.config.claim_ttl(),
            ),
            writer: ResultWriter::new(
                Arc::clone(&self.stores.objects),
                Arc::clone(&self.stores.table),
                self.config.object_prefix.clone(),
                branch.clone(),
            )
            .with_retry(self.config.retry.clone()),
            source: Arc::clone(&self.source),
            analyzer: Arc::clone(&self.analyzer),
            retry: self.config.retry.clone(),
            timeout: self.config.analysis_timeout(),
            max_image_bytes: self.config.max_image_bytes,
        });

        let assets = self
            .pool
            .run_all(keys, move |key| {
                let ctx = Arc::clone(&ctx);
                async move { ctx.process(key).await }
            })
            .await?;

        let report = RunReport {
            run_id,
            commit,
            branch,
            started_at,
            finished_at: Utc::now(),
            assets,
        };
        let counts = report.counts();
        tracing::info!(
            written = counts.written,
            skipped = counts.skipped,
            rejected = counts.rejected,
            failed = counts.failed,
            exit_code = report.exit_code(),
            "pipeline run finished"
        );
        Ok(report)
    }
}

/// Everything a worker needs for one run
struct RunContext {
    run_id: RunId,
    commit: CommitSha,
    dispatcher: Dispatcher,
    writer: ResultWriter,
    source: Arc<dyn AssetSource>,
    analyzer: Arc<dyn Analyzer>,
    retry: RetryPolicy,
    timeout: Duration,
    max_image_bytes: u64,
}

impl RunContext {
    async fn process(&self, key: AssetKey) -> AssetReport {
        let started = Instant::now();
        let span = tracing::info_span!("asset", asset = %key);
        let (outcome, attempts) = self.process_inner(&key).instrument(span).await;
        AssetReport {
            key,
            outcome,
            attempts,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    async fn process_inner(&self, key: &AssetKey) -> (AssetOutcome, u32) {
        let ticket = match self.dispatcher.claim(key, &self.commit).await {
            Ok(ticket) => ticket,
            Err(ClaimError::Conflict {
                state: RecordState::Succeeded,
                ..
            }) => {
                tracing::info!("already processed, skipping");
                return (AssetOutcome::Skipped(SkipReason::AlreadyProcessed), 0);
            }
            Err(ClaimError::Conflict { holder, .. }) => {
                tracing::warn!(holder = %holder, "claimed by another run, skipping");
                return (AssetOutcome::Skipped(SkipReason::InProgress { holder }), 0);
            }
            Err(e) => {
                tracing::error!(error = %e, "claim failed");
                return (AssetOutcome::Failed { error: e.to_string() }, 0);
            }
        };

        let size = match self.source.size(key).await {
            Ok(size) => size,
            Err(SourceError::Missing(_)) => return self.skip_missing(ticket).await,
            Err(e) => return self.fail(ticket, key, e.to_string(), 0).await,
        };
        if size > self.max_image_bytes {
            tracing::warn!(size, limit = self.max_image_bytes, "image too large, skipping");
            self.release(ticket).await;
            let reason = RejectReason::TooLarge {
                size,
                limit: self.max_image_bytes,
            };
            return (AssetOutcome::Rejected(reason), 0);
        }

        let read = retry(&self.retry, "read", |_| async move {
            self.source
                .read(key)
                .await
                .map_err(|source| AnalysisError::Source {
                    key: key.clone(),
                    source,
                })
        })
        .await;
        let bytes = match read.result {
            Ok(bytes) => bytes,
            Err(AnalysisError::Source {
                source: SourceError::Missing(_),
                ..
            }) => return self.skip_missing(ticket).await,
            Err(e) => return self.fail(ticket, key, e.to_string(), 0).await,
        };

        let input = ImageInput::new(key.clone(), bytes);
        let after_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        let analyzed = retry(&self.retry, "analyze", |attempt| {
            let input = &input;
            async move {
                tracing::debug!(attempt, analyzer = self.analyzer.name(), "analyzing");
                tokio::time::timeout(self.timeout, self.analyzer.analyze(input))
                    .await
                    .unwrap_or_else(|_| {
                        Err(AnalysisError::Timeout {
                            key: input.key.clone(),
                            after_ms,
                        })
                    })
            }
        })
        .await;
        let attempts = analyzed.attempts;
        let analysis = match analyzed.result {
            Ok(analysis) => analysis,
            Err(e) => {
                tracing::error!(attempts, error = %e, "analysis failed permanently");
                return self.fail(ticket, key, e.to_string(), attempts).await;
            }
        };

        let result = AnalysisResult::success(
            key.clone(),
            self.commit.clone(),
            analysis,
            &input.bytes,
            self.analyzer.name(),
        );
        if let Err(e) = self.dispatcher.confirm(&ticket).await {
            return self.lost_before_write(ticket, e, attempts).await;
        }
        let object_key = match self.writer.write(&result, self.run_id).await {
            Ok(object_key) => object_key,
            Err(e) => {
                tracing::error!(error = %e, "write failed, releasing claim");
                self.release(ticket).await;
                return (AssetOutcome::Failed { error: e.to_string() }, attempts);
            }
        };

        match self.dispatcher.complete(ticket).await {
            Ok(_) => (AssetOutcome::Written { object_key }, attempts),
            Err(e) => {
                tracing::error!(error = %e, "result written but claim was lost");
                (AssetOutcome::Failed { error: e.to_string() }, attempts)
            }
        }
    }

    async fn skip_missing(&self, ticket: ClaimTicket) -> (AssetOutcome, u32) {
        tracing::warn!("asset missing from checkout, skipping");
        self.release(ticket).await;
        (AssetOutcome::Skipped(SkipReason::Missing), 0)
    }

    /// Mark the claim failed, then record a failure row (best-effort)
    ///
    /// The row is only written while this run still holds the claim.
    async fn fail(
        &self,
        ticket: ClaimTicket,
        key: &AssetKey,
        error: String,
        attempts: u32,
    ) -> (AssetOutcome, u32) {
        match self.dispatcher.fail(ticket, &error).await {
            Ok(_) => {}
            Err(ClaimError::NotHolder { .. }) => {
                tracing::warn!(error = %error, "claim taken over, discarding failure");
                return (AssetOutcome::Skipped(SkipReason::ClaimLost), attempts);
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not mark claim failed, no failure row written");
                return (AssetOutcome::Failed { error }, attempts);
            }
        }
        if let Err(e) = self
            .writer
            .write_failure(key, &self.commit, &error, self.run_id)
            .await
        {
            tracing::warn!(error = %e, "could not record failure row");
        }
        (AssetOutcome::Failed { error }, attempts)
    }

    /// Holdership check before the write failed
    async fn lost_before_write(
        &self,
        ticket: ClaimTicket,
        error: ClaimError,
        attempts: u32,
    ) -> (AssetOutcome, u32) {
        if let ClaimError::NotHolder { .. } = error {
            tracing::warn!("claim taken over by another run, discarding result");
            return (AssetOutcome::Skipped(SkipReason::ClaimLost), attempts);
        }
        tracing::error!(error = %error, "cannot confirm claim, not writing");
        self.release(ticket).await;
        (
            AssetOutcome::Failed {
                error: error.to_string(),
            },
            attempts,
        )
    }

    async fn release(&self, ticket: ClaimTicket) {
        if let Err(e) = self.dispatcher.release(ticket).await {
            tracing::warn!(error = %e, "could not release claim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolutionError;
    use crate::types::Analysis;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves fixed bytes for every key except those named `missing*`
    struct StaticSource(Vec<u8>);

    #[async_trait]
    impl AssetSource for StaticSource {
        async fn size(&self, key: &AssetKey) -> Result<u64, SourceError> {
            if key.file_name().starts_with("missing") {
                return Err(SourceError::Missing(key.clone()));
            }
            Ok(self.0.len() as u64)
        }

        async fn read(&self, _key: &AssetKey) -> Result<Vec<u8>, SourceError> {
            Ok(self.0.clone())
        }
    }

    /// Counts calls; fails for `bad*` files
    #[derive(Default)]
    struct CountingAnalyzer(AtomicU32);

    #[async_trait]
    impl Analyzer for CountingAnalyzer {
        fn name(&self) -> &str {
            "counting"
        }

        async fn analyze(&self, image: &ImageInput) -> Result<Analysis, AnalysisError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if image.key.file_name().starts_with("bad") {
                return Err(AnalysisError::Unsupported {
                    key: image.key.clone(),
                    reason: "bad".into(),
                });
            }
            Ok(Analysis::new().with_label("Thing", 90.0))
        }
    }

    fn pipeline(analyzer: Arc<CountingAnalyzer>, bytes: usize) -> Pipeline {
        let config = PipelineConfig::new().with_retry(RetryPolicy::immediate(2));
        Pipeline::new(config, Stores::memory())
            .unwrap()
            .with_source(Arc::new(StaticSource(vec![0; bytes])))
            .with_analyzer(analyzer)
    }

const FULL_SHA: &str = "9fceb02d0ae598e95dc970b74767f19372d61af8";

        fn event(paths: &[&str]) -> ChangeEvent {
        ChangeEvent::new(CommitSha::new(FULL_SHA).unwrap()).with_paths(paths.iter().copied())
    }

    #[tokio::test]
    async fn mixed_outcomes_in_one_run() {
        let analyzer = Arc::new(CountingAnalyzer::default());
        let p = pipeline(Arc::clone(&analyzer), 16);

        let report = p
            .run(&event(&[
                "images/ok.png",
                "images/bad.png",
                "images/missing.png",
                "docs/readme.md",
            ]))
            .await
            .unwrap();

        let key = |s: &str| AssetKey::new(s).unwrap();
        assert!(matches!(
            report.outcome(&key("images/ok.png")),
            Some(AssetOutcome::Written { .. })
        ));
        assert!(report.outcome(&key("images/bad.png")).unwrap().is_failure());
        assert_eq!(
            report.outcome(&key("images/missing.png")),
            Some(&AssetOutcome::Skipped(SkipReason::Missing))
        );
        assert_eq!(report.assets.len(), 3);
        assert_eq!(report.exit_code(), 1);
        // Unsupported is permanent: one call for ok, one for bad
        assert_eq!(analyzer.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversize_is_rejected_without_failing_run() {
        let analyzer = Arc::new(CountingAnalyzer::default());
        let config = PipelineConfig::new().with_max_image_bytes(8);
        let p = Pipeline::new(config, Stores::memory())
            .unwrap()
            .with_source(Arc::new(StaticSource(vec![0; 9])))
            .with_analyzer(analyzer.clone());

        let report = p.run(&event(&["images/huge.png"])).await.unwrap();
        assert_eq!(
            report.assets[0].outcome,
            AssetOutcome::Rejected(RejectReason::TooLarge { size: 9, limit: 8 })
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(analyzer.0.load(Ordering::SeqCst), 0);
        // Claim released so a later run (e.g. with a higher limit) may retry
        assert!(p.stores().claims.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rerun_after_success_is_noop() {
        let analyzer = Arc::new(CountingAnalyzer::default());
        let p = pipeline(Arc::clone(&analyzer), 16);
        let ev = event(&["images/a.png", "images/b.png"]);

        assert_eq!(p.run(&ev).await.unwrap().counts().written, 2);
        let again = p.run(&ev).await.unwrap();

        assert_eq!(again.counts().skipped, 2);
        assert_eq!(again.exit_code(), 0);
        assert_eq!(analyzer.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let err = Pipeline::new(PipelineConfig::new().with_workers(0), Stores::memory()).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    async fn event_without_paths_is_fatal() {
        let p = pipeline(Arc::new(CountingAnalyzer::default()), 1);
        let err = p
            .run(&ChangeEvent::new(CommitSha::new(FULL_SHA).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Resolution(ResolutionError::MissingChangeSet(_))
        ));
    }

    #[tokio::test]
    async fn abbreviated_commit_without_repository_is_fatal() {
        let analyzer = Arc::new(CountingAnalyzer::default());
        let p = pipeline(Arc::clone(&analyzer), 1);
        let event = ChangeEvent::new(CommitSha::new(&FULL_SHA[..7]).unwrap())
            .with_paths(["images/a.png"]);

        let err = p.run(&event).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Resolution(ResolutionError::AbbreviatedCommit(_))
        ));
        assert_eq!(analyzer.0.load(Ordering::SeqCst), 0);
        assert_eq!(p.stores().status("analysis/").await.unwrap().claimed, 0);
    }
}
