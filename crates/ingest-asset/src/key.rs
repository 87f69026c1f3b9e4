//! Asset keys
//!
//! Provides [`AssetKey`], the normalized repository path of one image. The
//! key is the idempotency key for claims and the primary key of the lookup
//! table, so two spellings of the same file (`./images/a.png`,
//! `images//a.png`) must produce the same key.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Normalized repository path of an image asset
///
/// Segments are separated by `/`; there is no leading `./`, no `..`, no
/// empty segment and no leading `/`.
///
/// # Examples
/// - `images/cat.png` → `images/cat.png`
/// - `./images\\dog.png` → `images/dog.png`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetKey(String);

impl AssetKey {
    /// Normalize a repository path into a key
    ///
    /// # Errors
    /// Returns error if the path is empty, absolute, or escapes the
    /// repository root
    pub fn new(path: &str) -> Result<Self, PathError> {
        normalize_repo_path(path).map(Self)
    }

    /// Path as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments from root to leaf
    #[inline]
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Final segment (the file name)
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Lowercased extension of the file name, if any
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) => Some(name[idx + 1..].to_ascii_lowercase()),
        }
    }

    /// Filesystem-safe identifier stable for this key
    ///
    /// Used as the directory / file stem by storage backends.
    #[must_use]
    pub fn storage_id(&self) -> String {
        ContentHash::compute_tagged("image-ingest:asset:v1", &[&self.0]).to_string()
    }
}

impl Display for AssetKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssetKey {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for AssetKey {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<AssetKey> for String {
    fn from(key: AssetKey) -> Self {
        key.0
    }
}

impl AsRef<str> for AssetKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Normalize a repository-relative path
///
/// Backslashes become `/`, `.` segments and repeated separators are
/// dropped. A leading `/` or any `..` segment is rejected.
///
/// # Errors
/// See [`PathError`].
pub fn normalize_repo_path(raw: &str) -> Result<String, PathError> {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return Err(PathError::Empty);
    }
    if unified.starts_with('/') {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut segments = Vec::new();
    for seg in unified.split('/') {
        match seg {
            "" | "." => continue,
            ".." => return Err(PathError::EscapesRoot(raw.to_string())),
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

/// Errors related to asset paths
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// Nothing left after normalization
    #[error("path is empty")]
    Empty,

    /// Path starts at the filesystem root
    #[error("path '{0}' is absolute")]
    Absolute(String),

    /// Path contains a `..` segment
    #[error("path '{0}' escapes the repository root")]
    EscapesRoot(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_key_normalizes_spellings() {
        let a = AssetKey::new("images/cat.png").unwrap();
        let b = AssetKey::new("./images//cat.png").unwrap();
        let c = AssetKey::new("images\\cat.png").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.as_str(), "images/cat.png");
    }

    #[test]
    fn asset_key_rejects_escapes() {
        assert!(matches!(
            AssetKey::new("images/../secret.png"),
            Err(PathError::EscapesRoot(_))
        ));
        assert!(matches!(
            AssetKey::new("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert_eq!(AssetKey::new("./"), Err(PathError::Empty));
        assert_eq!(AssetKey::new("   "), Err(PathError::Empty));
    }

    #[test]
    fn asset_key_file_name_and_extension() {
        let key = AssetKey::new("images/pets/Cat.JPEG").unwrap();
        assert_eq!(key.file_name(), "Cat.JPEG");
        assert_eq!(key.extension().as_deref(), Some("jpeg"));
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["images", "pets", "Cat.JPEG"]);

        let dotfile = AssetKey::new("images/.gitkeep").unwrap();
        assert_eq!(dotfile.extension(), None);

        let bare = AssetKey::new("images/README").unwrap();
        assert_eq!(bare.extension(), None);
    }

    #[test]
    fn asset_key_storage_id_is_stable_and_distinct() {
        let a = AssetKey::new("images/cat.png").unwrap();
        let same = AssetKey::new("./images/cat.png").unwrap();
        let other = AssetKey::new("images/dog.png").unwrap();

        assert_eq!(a.storage_id(), same.storage_id());
        assert_ne!(a.storage_id(), other.storage_id());
        assert_eq!(a.storage_id().len(), 64);
        assert!(a.storage_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn asset_key_serde_validates() {
        let key: AssetKey = serde_json::from_str("\"./images/a.png\"").unwrap();
        assert_eq!(key.as_str(), "images/a.png");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"images/a.png\"");

        let bad: Result<AssetKey, _> = serde_json::from_str("\"../a.png\"");
        assert!(bad.is_err());
    }
}
