//! Object store for raw analysis payloads

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use ingest_asset::{normalize_repo_path, AssetKey, CommitSha};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Relative, `/`-separated object key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Validate a key
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidKey`] for empty, absolute or escaping keys
    pub fn new(raw: &str) -> Result<Self, StoreError> {
        normalize_repo_path(raw)
            .map(Self)
            .map_err(|e| StoreError::InvalidKey(e.to_string()))
    }

    /// Versioned payload key: `<prefix><asset storage id>/<commit>.json`
    ///
    /// # Errors
    /// Returns error if `prefix` is not a valid relative path
    pub fn for_result(prefix: &str, asset: &AssetKey, commit: &CommitSha) -> Result<Self, StoreError> {
        let leaf = format!("{}/{commit}.json", asset.storage_id());
        match prefix.trim_matches('/') {
            "" => Self::new(&leaf),
            p => Self::new(&format!("{p}/{leaf}")),
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if this key lies under `prefix` (segment-wise)
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        match normalize_repo_path(prefix) {
            Ok(p) => self.0 == p || self.0.starts_with(&format!("{p}/")),
            Err(_) => true,
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectKey {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ObjectKey> for String {
    fn from(key: ObjectKey) -> Self {
        key.0
    }
}

/// Long-term payload storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, replacing any previous value
    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> Result<(), StoreError>;

    /// Fetch a payload
    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Delete a payload; returns whether it existed
    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError>;

    /// Keys under `prefix` (an empty prefix lists everything), sorted
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectKey>, StoreError>;
}

/// In-process object store
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<ObjectKey, Vec<u8>>,
}

impl MemoryObjectStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &ObjectKey, body: Vec<u8>) -> Result<(), StoreError> {
        self.objects.insert(key.clone(), body);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        Ok(self.objects.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let mut keys: Vec<_> = self
            .objects
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| prefix.is_empty() || k.has_prefix(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
