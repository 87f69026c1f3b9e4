//! Watched-prefix and image-extension filtering
//!
//! Provides [`WatchedPrefix`] (segment-wise path prefix) and [`ImageFilter`]
//! (prefix + allowed extensions), used by the change-set resolver to decide
//! which changed paths are image assets.

use crate::key::{normalize_repo_path, AssetKey, PathError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

/// Extensions analyzed when none are configured
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Directory prefix whose changes trigger analysis
///
/// Matching is by whole segments: `images` matches `images/a.png` and
/// `images/sub/b.png`, never `images2/a.png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WatchedPrefix(Vec<String>);

impl WatchedPrefix {
    /// Build from a path such as `images/` or `assets/img`
    ///
    /// # Errors
    /// Returns error if the prefix does not normalize to a relative path
    pub fn new(prefix: &str) -> Result<Self, PathError> {
        let normalized = normalize_repo_path(prefix)?;
        Ok(Self(normalized.split('/').map(str::to_string).collect()))
    }

    /// Prefix segments
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Check if `key` lies strictly below this prefix
    #[must_use]
    pub fn contains(&self, key: &AssetKey) -> bool {
        let mut segs = key.segments();
        for expected in &self.0 {
            match segs.next() {
                Some(seg) if seg == expected => {}
                _ => return false,
            }
        }
        segs.next().is_some()
    }
}

impl Default for WatchedPrefix {
    fn default() -> Self {
        Self(vec!["images".to_string()])
    }
}

impl Display for WatchedPrefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.0.join("/"))
    }
}

impl TryFrom<String> for WatchedPrefix {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<WatchedPrefix> for String {
    fn from(prefix: WatchedPrefix) -> Self {
        prefix.to_string()
    }
}

/// Decides whether a changed path is an image asset to analyze
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFilter {
    prefix: WatchedPrefix,
    extensions: BTreeSet<String>,
}

impl ImageFilter {
    /// Create filter with explicit extensions (leading dots and case ignored)
    #[must_use]
    pub fn new<I, S>(prefix: WatchedPrefix, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        Self { prefix, extensions }
    }

    /// Watched prefix
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> &WatchedPrefix {
        &self.prefix
    }

    /// Allowed extensions, lowercase
    #[inline]
    #[must_use]
    pub fn extensions(&self) -> &BTreeSet<String> {
        &self.extensions
    }

    /// Check a normalized key
    #[must_use]
    pub fn matches(&self, key: &AssetKey) -> bool {
        self.prefix.contains(key)
            && key
                .extension()
                .is_some_and(|ext| self.extensions.contains(&ext))
    }

    /// Normalize a raw path and return its key if it passes the filter
    ///
    /// Paths that fail normalization are treated as non-matching.
    #[must_use]
    pub fn accept(&self, raw: &str) -> Option<AssetKey> {
        AssetKey::new(raw).ok().filter(|key| self.matches(key))
    }
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self::new(WatchedPrefix::default(), DEFAULT_IMAGE_EXTENSIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AssetKey {
        AssetKey::new(s).unwrap()
    }

    #[test]
    fn watched_prefix_matches_whole_segments() {
        let prefix = WatchedPrefix::new("images/").unwrap();
        assert!(prefix.contains(&key("images/cat.png")));
        assert!(prefix.contains(&key("images/pets/cat.png")));
        assert!(!prefix.contains(&key("images2/cat.png")));
        assert!(!prefix.contains(&key("docs/images/cat.png")));
        // The directory itself is not an asset under the prefix
        assert!(!prefix.contains(&key("images")));
    }

    #[test]
    fn watched_prefix_nested_and_display() {
        let prefix = WatchedPrefix::new("./assets//img").unwrap();
        assert_eq!(prefix.to_string(), "assets/img/");
        assert!(prefix.contains(&key("assets/img/a.png")));
        assert!(!prefix.contains(&key("assets/a.png")));
    }

    #[test]
    fn image_filter_default_extensions() {
        let filter = ImageFilter::default();
        assert!(filter.accept("images/cat.png").is_some());
        assert!(filter.accept("images/cat.JPG").is_some());
        assert!(filter.accept("images/cat.jpeg").is_some());
        assert!(filter.accept("images/cat.gif").is_none());
        assert!(filter.accept("images/notes.txt").is_none());
        assert!(filter.accept("docs/readme.md").is_none());
        assert!(filter.accept("images/../x.png").is_none());
    }

    #[test]
    fn image_filter_custom_extensions() {
        let filter = ImageFilter::new(WatchedPrefix::default(), [".WebP", "gif", ""]);
        assert_eq!(
            filter.extensions().iter().cloned().collect::<Vec<_>>(),
            vec!["gif".to_string(), "webp".to_string()]
        );
        assert!(filter.accept("images/a.webp").is_some());
        assert!(filter.accept("images/a.png").is_none());
    }
}
