//! Analysis collaborator
//!
//! [`Analyzer`] is the opaque `analyze(image) -> result` capability. It may
//! be slow or blocking; callers wrap each attempt in a timeout and retry
//! transient failures. [`AssetSource`] supplies the image bytes.

use crate::error::{AnalysisError, SourceError};
use crate::types::Analysis;
use async_trait::async_trait;
use image::{ImageDecoder, ImageReader};
use ingest_asset::AssetKey;
use std::io::{Cursor, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

/// Image handed to an analyzer
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub key: AssetKey,
    pub bytes: Arc<[u8]>,
}

impl ImageInput {
    #[inline]
    #[must_use]
    pub fn new(key: AssetKey, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            key,
            bytes: bytes.into(),
        }
    }
}

/// Opaque analysis capability
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Name recorded with each result
    fn name(&self) -> &str;

    /// Analyze one image
    ///
    /// # Errors
    /// [`AnalysisError`]; retryable variants are retried by the pipeline
    async fn analyze(&self, image: &ImageInput) -> Result<Analysis, AnalysisError>;
}

/// Reads image bytes for an asset
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Size in bytes, checked against the size gate before reading
    async fn size(&self, key: &AssetKey) -> Result<u64, SourceError>;

    /// Full file contents
    async fn read(&self, key: &AssetKey) -> Result<Vec<u8>, SourceError>;
}

/// Reads assets from a repository checkout
#[derive(Debug, Clone)]
pub struct WorkspaceSource {
    root: PathBuf,
}

impl WorkspaceSource {
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, key: &AssetKey) -> PathBuf {
        key.segments().fold(self.root.clone(), |acc, seg| acc.join(seg))
    }

    fn map_err(&self, key: &AssetKey, path: PathBuf, e: std::io::Error) -> SourceError {
        if e.kind() == ErrorKind::NotFound {
            SourceError::Missing(key.clone())
        } else {
            SourceError::Io { path, source: e }
        }
    }
}

#[async_trait]
impl AssetSource for WorkspaceSource {
    async fn size(&self, key: &AssetKey) -> Result<u64, SourceError> {
        let path = self.path(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(SourceError::Missing(key.clone())),
            Err(e) => Err(self.map_err(key, path, e)),
        }
    }

    async fn read(&self, key: &AssetKey) -> Result<Vec<u8>, SourceError> {
        let path = self.path(key);
        tokio::fs::read(&path)
            .await
            .map_err(|e| self.map_err(key, path.clone(), e))
    }
}

/// Built-in analyzer that decodes the image header
///
/// Reports `format`, `width`, `height` and `color_type`. It produces no
/// labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageProbeAnalyzer;

impl ImageProbeAnalyzer {
    fn inspect(key: &AssetKey, bytes: &[u8]) -> Result<Analysis, AnalysisError> {
        let unsupported = |reason: String| AnalysisError::Unsupported {
            key: key.clone(),
            reason,
        };

        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| unsupported(e.to_string()))?;
        let format = reader
            .format()
            .ok_or_else(|| unsupported("unrecognized image format".to_string()))?;
        let decoder = reader.into_decoder().map_err(|e| unsupported(e.to_string()))?;
        let (width, height) = decoder.dimensions();

        Ok(Analysis::new()
            .with_field(
                "format",
                format.extensions_str().first().copied().unwrap_or("unknown"),
            )
            .with_field("width", width)
            .with_field("height", height)
            .with_field("color_type", format!("{:?}", decoder.color_type()).to_lowercase()))
    }
}

#[async_trait]
impl Analyzer for ImageProbeAnalyzer {
    fn name(&self) -> &str {
        "image-probe"
    }

    async fn analyze(&self, image: &ImageInput) -> Result<Analysis, AnalysisError> {
        let key = image.key.clone();
        let bytes = Arc::clone(&image.bytes);
        tokio::task::spawn_blocking(move || Self::inspect(&key, &bytes))
            .await
            .map_err(|e| AnalysisError::Task {
                key: image.key.clone(),
                reason: e.to_string(),
            })?
    }
}
