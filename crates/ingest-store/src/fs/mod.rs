//! Filesystem-backed stores
//!
//! Directory layout (each store takes its own root):
//!
//! ```text
//! claims/<claim storage id>.json    ProcessingRecord
//! claims/<claim storage id>.lock    held only during a conditional write
//! objects/<object key>              raw payloads
//! rows/<asset storage id>.json      TableRow
//! ```
//!
//! Several processes may share one directory; claim updates go through a
//! per-key [`KeyLock`] and every file write is atomic.

pub mod atomic;

use crate::claims::ClaimStore;
use crate::error::{ClaimError, StoreError};
use crate::objects::{ObjectKey, ObjectStore};
use crate::record::{ClaimDecision, ClaimKey, ProcessingRecord, RecordState, RunId};
use crate::table::{ResultTable, TableRow};
use async_trait::async_trait;
use atomic::{is_temp_name, read_optional, remove_optional, write_atomic, KeyLock};
use chrono::Utc;
use ingest_asset::AssetKey;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long a conditional write waits for the per-key lock
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match read_optional(path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes).await
}

/// `*.json` documents directly under `dir`, skipping temp files
async fn json_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut out = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !is_temp_name(&name) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Claim table stored as one JSON document per (asset, commit)
#[derive(Debug, Clone)]
pub struct FsClaimStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FsClaimStore {
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Override the lock wait
    #[inline]
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &ClaimKey) -> PathBuf {
        self.root.join(format!("{}.json", key.storage_id()))
    }

    fn lock_path(&self, key: &ClaimKey) -> PathBuf {
        self.root.join(format!("{}.lock", key.storage_id()))
    }

    async fn lock(&self, key: &ClaimKey) -> Result<KeyLock, StoreError> {
        KeyLock::acquire(self.lock_path(key), self.lock_timeout).await
    }

    async fn settle(
        &self,
        key: &ClaimKey,
        run: RunId,
        to: RecordState,
        error: Option<String>,
    ) -> Result<ProcessingRecord, ClaimError> {
        let _guard = self.lock(key).await?;
        let path = self.record_path(key);
        let mut record: ProcessingRecord =
            read_json(&path).await?.ok_or_else(|| ClaimError::NotHolder {
                key: key.clone(),
                run,
            })?;
        record.settle(run, to, error, Utc::now())?;
        write_json(&path, &record).await?;
        Ok(record)
    }
}

#[async_trait]
impl ClaimStore for FsClaimStore {
    async fn try_claim(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError> {
        let _guard = self.lock(key).await?;
        let path = self.record_path(key);
        let now = Utc::now();

        let existing: Option<ProcessingRecord> = read_json(&path).await?;
        let decision = existing
            .as_ref()
            .map_or(ClaimDecision::Fresh, |r| r.decide(now));

        let record = match (decision, existing) {
            (ClaimDecision::Conflict, Some(current)) => return Err(current.conflict()),
            (_, Some(mut current)) => {
                current.reclaim(run, lease, now)?;
                current
            }
            (_, None) => ProcessingRecord::claimed(key.clone(), run, lease, now),
        };

        write_json(&path, &record).await?;
        tracing::debug!(claim = %key, run = %run, attempts = record.attempts, "claim written");
        Ok(record)
    }

    async fn complete(&self, key: &ClaimKey, run: RunId) -> Result<ProcessingRecord, ClaimError> {
        self.settle(key, run, RecordState::Succeeded, None).await
    }

    async fn fail(
        &self,
        key: &ClaimKey,
        run: RunId,
        reason: &str,
    ) -> Result<ProcessingRecord, ClaimError> {
        self.settle(key, run, RecordState::Failed, Some(reason.to_string()))
            .await
    }

    async fn renew(
        &self,
        key: &ClaimKey,
        run: RunId,
        lease: Duration,
    ) -> Result<ProcessingRecord, ClaimError> {
        let _guard = self.lock(key).await?;
        let path = self.record_path(key);
        let mut record: ProcessingRecord =
            read_json(&path).await?.ok_or_else(|| ClaimError::NotHolder {
                key: key.clone(),
                run,
            })?;
        record.renew(run, lease, Utc::now())?;
        write_json(&path, &record).await?;
        Ok(record)
    }

    async fn release(&self, key: &ClaimKey, run: RunId) -> Result<(), ClaimError> {
        let _guard = self.lock(key).await?;
        let path = self.record_path(key);
        let record: ProcessingRecord =
            read_json(&path).await?.ok_or_else(|| ClaimError::NotHolder {
                key: key.clone(),
                run,
            })?;
        record.ensure_releasable(run)?;
        remove_optional(&path).await?;
        Ok(())
    }

    async fn get(&self, key: &ClaimKey) -> Result<Option<ProcessingRecord>, StoreError> {
        read_json(&self.record_path(key)).await
    }

    async fn list(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let mut out = Vec::new();
        for path in json_files(&self.root).await? {
            // A record may be released between listing and reading
            if let Some(record) = read_json::<ProcessingRecord>(&path).await? {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

/// Object store rooted at a directory; keys map to relative paths
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        key.as_str()
            .split('/')
            .fold(self.root.clone(), |acc, seg| acc.join(seg))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> Result<(), StoreError> {
        write_atomic(&self.object_path(key), &body).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>, StoreError> {
        read_optional(&self.object_path(key)).await
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        remove_optional(&self.object_path(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(&dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(&dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let child = if rel.is_empty() {
                    name.clone()
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(entry.path(), e))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), child));
                } else if !is_temp_name(&name) {
                    let key = ObjectKey::new(&child)?;
                    if prefix.is_empty() || key.has_prefix(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

/// Lookup table stored as one JSON document per asset
#[derive(Debug, Clone)]
pub struct FsResultTable {
    root: PathBuf,
}

impl FsResultTable {
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn row_path(&self, key: &AssetKey) -> PathBuf {
        self.root.join(format!("{}.json", key.storage_id()))
    }
}

#[async_trait]
impl ResultTable for FsResultTable {
    async fn upsert(&self, row: TableRow) -> Result<(), StoreError> {
        write_json(&self.row_path(&row.key), &row).await
    }

    async fn get(&self, key: &AssetKey) -> Result<Option<TableRow>, StoreError> {
        read_json(&self.row_path(key)).await
    }

    async fn delete(&self, key: &AssetKey) -> Result<bool, StoreError> {
        remove_optional(&self.row_path(key)).await
    }

    async fn scan(&self) -> Result<Vec<TableRow>, StoreError> {
        let mut rows = Vec::new();
        for path in json_files(&self.root).await? {
            if let Some(row) = read_json::<TableRow>(&path).await? {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}
