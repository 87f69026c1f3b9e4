//! Testing utilities for the image-ingest workspace
//!
//! Shared collaborators, fault injection and fixtures.

#![allow(missing_docs)]

use async_trait::async_trait;
use dashmap::DashMap;
use ingest_asset::{AssetKey, CommitSha};
use ingest_core::{
    Analysis, AnalysisError, Analyzer, AssetSource, ChangeEvent, ImageInput, SourceError,
};
use ingest_store::{ObjectKey, ObjectStore, ResultTable, StoreError, TableRow};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn key(path: &str) -> AssetKey {
    AssetKey::new(path).unwrap()
}

pub fn commit(sha: &str) -> CommitSha {
    CommitSha::new(sha).unwrap()
}

/// Merge event carrying an explicit path list
pub fn event(sha: &str, paths: &[&str]) -> ChangeEvent {
    ChangeEvent::new(commit(sha)).with_paths(paths.iter().copied())
}

/// Encode a blank RGB PNG
pub fn tiny_png(width: u32, height: u32) -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::RgbImage::new(width, height)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Decrement `counter` if positive; true if a unit was taken
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Clone, Copy)]
struct Script {
    failures: u32,
    transient: bool,
}

/// Analyzer whose per-asset behavior is scripted up front
///
/// Unscripted assets succeed with a single `"Thing"` label.
#[derive(Debug, Default)]
pub struct ScriptedAnalyzer {
    scripts: DashMap<AssetKey, Script>,
    calls: DashMap<AssetKey, u32>,
    delay: Option<Duration>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the first `n` calls for `path` with a retryable error
    pub fn fail_transiently(self, path: &str, n: u32) -> Self {
        self.scripts.insert(
            key(path),
            Script {
                failures: n,
                transient: true,
            },
        );
        self
    }

    /// Fail every call for `path` with a permanent error
    pub fn fail_permanently(self, path: &str) -> Self {
        self.scripts.insert(
            key(path),
            Script {
                failures: u32::MAX,
                transient: false,
            },
        );
        self
    }

    /// Stop failing `path`
    pub fn heal(&self, path: &str) {
        self.scripts.remove(&key(path));
    }

    pub fn calls(&self, path: &str) -> u32 {
        self.calls.get(&key(path)).map_or(0, |c| *c.value())
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.iter().map(|c| *c.value()).sum()
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(&self, image: &ImageInput) -> Result<Analysis, AnalysisError> {
        *self.calls.entry(image.key.clone()).or_insert(0) += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.scripts.get_mut(&image.key).and_then(|mut script| {
            (script.failures > 0).then(|| {
                if script.failures != u32::MAX {
                    script.failures -= 1;
                }
                script.transient
            })
        });
        match failing {
            Some(true) => Err(AnalysisError::Unavailable {
                key: image.key.clone(),
                reason: "scripted outage".into(),
            }),
            Some(false) => Err(AnalysisError::Unsupported {
                key: image.key.clone(),
                reason: "scripted rejection".into(),
            }),
            None => Ok(Analysis::new()
                .with_field("bytes", image.bytes.len())
                .with_label("Thing", 97.5)),
        }
    }
}

/// In-memory asset bytes
#[derive(Debug, Default)]
pub struct MemorySource {
    files: DashMap<AssetKey, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(key(path), bytes);
        self
    }

    /// Add a small valid PNG at each path
    pub fn with_images(self, paths: &[&str]) -> Self {
        for path in paths {
            self.files.insert(key(path), tiny_png(2, 2));
        }
        self
    }

    pub fn remove(&self, path: &str) {
        self.files.remove(&key(path));
    }
}

#[async_trait]
impl AssetSource for MemorySource {
    async fn size(&self, key: &AssetKey) -> Result<u64, SourceError> {
        self.files
            .get(key)
            .map(|f| f.value().len() as u64)
            .ok_or_else(|| SourceError::Missing(key.clone()))
    }

    async fn read(&self, key: &AssetKey) -> Result<Vec<u8>, SourceError> {
        self.files
            .get(key)
            .map(|f| f.value().clone())
            .ok_or_else(|| SourceError::Missing(key.clone()))
    }
}

/// Object store wrapper that refuses writes on demand
pub struct FlakyObjectStore {
    inner: Arc<dyn ObjectStore>,
    failing_puts: AtomicU32,
}

impl FlakyObjectStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self {
            inner,
            failing_puts: AtomicU32::new(0),
        }
    }

    /// Refuse the next `n` puts
    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FlakyObjectStore {
    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> Result<(), StoreError> {
        if take_one(&self.failing_puts) {
            return Err(StoreError::Unavailable(format!("injected put failure for {key}")));
        }
        self.inner.put(key, body).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectKey>, StoreError> {
        self.inner.list(prefix).await
    }
}

/// Lookup table wrapper that refuses upserts on demand
pub struct FlakyTable {
    inner: Arc<dyn ResultTable>,
    failing_upserts: AtomicU32,
}

impl FlakyTable {
    pub fn new(inner: Arc<dyn ResultTable>) -> Self {
        Self {
            inner,
            failing_upserts: AtomicU32::new(0),
        }
    }

    /// Refuse the next `n` upserts
    pub fn fail_next_upserts(&self, n: u32) {
        self.failing_upserts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultTable for FlakyTable {
    async fn upsert(&self, row: TableRow) -> Result<(), StoreError> {
        if take_one(&self.failing_upserts) {
            return Err(StoreError::Unavailable(format!("injected upsert failure for {}", row.key)));
        }
        self.inner.upsert(row).await
    }

    async fn get(&self, key: &AssetKey) -> Result<Option<TableRow>, StoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &AssetKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(&self) -> Result<Vec<TableRow>, StoreError> {
        self.inner.scan().await
    }
}
