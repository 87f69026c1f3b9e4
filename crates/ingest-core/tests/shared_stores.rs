//! Concurrent and crash-interrupted runs against shared stores

use futures::future::join_all;
use ingest_core::{AssetOutcome, Pipeline, PipelineConfig, RetryPolicy, SkipReason, Stores};
use ingest_store::{ClaimKey, ObjectKey, RecordState, RunId};
use ingest_test_utils::{commit, event, key, MemorySource, ScriptedAnalyzer};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const SHA: &str = "4f2a7c1d9e0b8a7f6e5d4c3b2a19087f6e5d4c3b";
const IMAGES: [&str; 3] = ["images/cat.png", "images/dog.png", "images/owl.jpg"];

fn pipeline(config: PipelineConfig, stores: Stores, analyzer: Arc<ScriptedAnalyzer>) -> Pipeline {
    Pipeline::new(config, stores)
        .unwrap()
        .with_source(Arc::new(MemorySource::new().with_images(&IMAGES)))
        .with_analyzer(analyzer)
}

/// Every asset is written by exactly one run; the others skip it
fn assert_single_writer(reports: &[ingest_core::RunReport]) {
    for path in IMAGES {
        let outcomes: Vec<_> = reports.iter().filter_map(|r| r.outcome(&key(path))).collect();
        let writers = outcomes
            .iter()
            .filter(|o| matches!(o, AssetOutcome::Written { .. }))
            .count();
        assert_eq!(writers, 1, "{path}: {outcomes:?}");
        assert!(outcomes.iter().all(|o| matches!(
            o,
            AssetOutcome::Written { .. }
                | AssetOutcome::Skipped(SkipReason::InProgress { .. } | SkipReason::AlreadyProcessed)
        )));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_events_in_memory_analyze_once() {
    let analyzer = Arc::new(ScriptedAnalyzer::new().with_delay(Duration::from_millis(30)));
    let stores = Stores::memory();
    let runs: Vec<_> = (0..4)
        .map(|_| pipeline(PipelineConfig::new(), stores.clone(), Arc::clone(&analyzer)))
        .collect();
    let ev = event(SHA, &IMAGES);

    let reports: Vec<_> = join_all(runs.iter().map(|p| p.run(&ev)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_single_writer(&reports);
    assert!(reports.iter().all(|r| r.exit_code() == 0));
    for path in IMAGES {
        assert_eq!(analyzer.calls(path), 1, "{path}");
    }
    assert_eq!(stores.table.scan().await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_events_on_filesystem_analyze_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::new().with_store_root(dir.path());
    let analyzer = Arc::new(ScriptedAnalyzer::new().with_delay(Duration::from_millis(30)));

    // Separate store handles over one directory, as separate processes would have
    let runs: Vec<_> = (0..3)
        .map(|_| {
            pipeline(
                config.clone(),
                Stores::filesystem(&config),
                Arc::clone(&analyzer),
            )
        })
        .collect();
    let ev = event(SHA, &IMAGES);

    let reports: Vec<_> = join_all(runs.iter().map(|p| p.run(&ev)))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_single_writer(&reports);
    assert_eq!(analyzer.total_calls(), 3);

    let status = Stores::filesystem(&config).status("analysis/").await.unwrap();
    assert_eq!((status.succeeded, status.rows_success, status.objects), (3, 3, 3));
    assert_eq!(status.claimed, 0);
}

#[tokio::test]
async fn crash_after_object_write_is_swept_and_redone() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::new()
        .with_store_root(dir.path())
        .with_retry(RetryPolicy::no_retry());
    let stores = Stores::filesystem(&config);
    let cat = key("images/cat.png");
    let claim = ClaimKey::new(cat.clone(), commit(SHA));
    let orphan = ObjectKey::for_result("analysis/", &cat, &commit(SHA)).unwrap();

    // A run that died between the object put and the table row
    stores.claims.try_claim(&claim, RunId::new(), Duration::ZERO).await.unwrap();
    stores.objects.put(&orphan, b"{\"partial\":true}".to_vec()).await.unwrap();

    let analyzer = Arc::new(ScriptedAnalyzer::new());
    let p = pipeline(config.clone(), stores.clone(), Arc::clone(&analyzer));

    let sweep = p.reconciler().sweep().await.unwrap();
    assert_eq!(sweep.released, vec![claim.clone()]);
    assert_eq!(sweep.orphans_deleted, vec![orphan.clone()]);
    assert!(stores.table.get(&cat).await.unwrap().is_none());

    let report = p.run(&event(SHA, &["images/cat.png"])).await.unwrap();
    assert_eq!(
        report.outcome(&cat),
        Some(&AssetOutcome::Written {
            object_key: orphan.clone()
        })
    );
    assert_eq!(analyzer.calls("images/cat.png"), 1);
    let record = stores.claims.get(&claim).await.unwrap().unwrap();
    assert_eq!(record.state, RecordState::Succeeded);
}
