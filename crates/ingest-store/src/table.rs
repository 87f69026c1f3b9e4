//! Lookup table of processed assets
//!
//! One row per [`AssetKey`] holding the queryable summary of the latest
//! result. Rows are replaced wholesale on reprocessing.

use crate::error::StoreError;
use crate::objects::ObjectKey;
use crate::record::RunId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ingest_asset::{AssetKey, CommitSha, ContentHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Outcome recorded for an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
}

impl Display for ResultStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
        })
    }
}

/// Named label with a confidence percentage (0.0 - 100.0)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: f64,
}

impl Label {
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence: confidence.clamp(0.0, 100.0),
        }
    }
}

/// Queryable row for one asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: AssetKey,
    pub commit: CommitSha,
    pub branch: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub summary: BTreeMap<String, serde_json::Value>,
    /// Payload location; absent for failure rows
    pub object_key: Option<ObjectKey>,
    pub content_hash: Option<ContentHash>,
    pub size_bytes: Option<u64>,
    pub error: Option<String>,
    pub analyzed_at: DateTime<Utc>,
    pub run_id: RunId,
}

/// Summary index keyed by asset
#[async_trait]
pub trait ResultTable: Send + Sync {
    /// Insert or replace the row for `row.key`
    async fn upsert(&self, row: TableRow) -> Result<(), StoreError>;

    async fn get(&self, key: &AssetKey) -> Result<Option<TableRow>, StoreError>;

    /// Delete a row; returns whether it existed
    async fn delete(&self, key: &AssetKey) -> Result<bool, StoreError>;

    /// All rows sorted by key
    async fn scan(&self) -> Result<Vec<TableRow>, StoreError>;
}

/// In-process table
#[derive(Debug, Default)]
pub struct MemoryResultTable {
    rows: DashMap<AssetKey, TableRow>,
}

impl MemoryResultTable {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl ResultTable for MemoryResultTable {
    async fn upsert(&self, row: TableRow) -> Result<(), StoreError> {
        self.rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn get(&self, key: &AssetKey) -> Result<Option<TableRow>, StoreError> {
        Ok(self.rows.get(key).map(|r| r.value().clone()))
    }

    async fn delete(&self, key: &AssetKey) -> Result<bool, StoreError> {
        Ok(self.rows.remove(key).is_some())
    }

    async fn scan(&self) -> Result<Vec<TableRow>, StoreError> {
        let mut rows: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }
}
