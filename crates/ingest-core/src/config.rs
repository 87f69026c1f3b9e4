//! Pipeline configuration
//!
//! Layered: defaults, then an optional TOML file, then `INGEST_*`
//! environment variables, then whatever the caller sets with `with_*`.
//!
//! ```toml
//! region = "eu-west-1"
//! bucket = "image-results"
//! table = "image-index"
//! watch_prefix = "images/"
//! extensions = ["jpg", "jpeg", "png"]
//! workers = 8
//!
//! [retry]
//! max_attempts = 5
//! ```

use crate::error::ConfigError;
use ingest_asset::{ImageFilter, WatchedPrefix, DEFAULT_IMAGE_EXTENSIONS};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default size gate (5 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: u64 = 5_242_880;

/// Bounded exponential backoff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that tries once
    #[inline]
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Policy with no delay between attempts (tests)
    #[inline]
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1,
            jitter: false,
        }
    }

    /// Un-jittered delay before retry number `attempt` (1-based; 0 means
    /// the first try, which has no delay)
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(attempt - 1);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Delay actually slept before retry number `attempt`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(ms / 2..=ms))
    }
}

/// Everything a pipeline run needs to know
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Opaque values handed to the storage collaborator
    pub region: String,
    pub bucket: String,
    pub table: String,

    pub watch_prefix: WatchedPrefix,
    pub extensions: Vec<String>,
    pub max_image_bytes: u64,

    /// Concurrent analyses within one run
    pub workers: usize,
    pub analysis_timeout_ms: u64,
    /// Lease on a claim before another run may take it over
    pub claim_ttl_secs: u64,
    pub retry: RetryPolicy,

    /// Checkout the asset paths are read from
    pub workspace_root: PathBuf,
    /// Root of the filesystem-backed stores
    pub store_root: PathBuf,
    /// Prefix of result objects inside the bucket
    pub object_prefix: String,
    /// Git ref of the merge target, e.g. `refs/heads/main`
    pub git_ref: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            region: "local".to_string(),
            bucket: "image-ingest".to_string(),
            table: "image-results".to_string(),
            watch_prefix: WatchedPrefix::default(),
            extensions: DEFAULT_IMAGE_EXTENSIONS.iter().map(|e| (*e).to_string()).collect(),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            workers: 4,
            analysis_timeout_ms: 60_000,
            claim_ttl_secs: 900,
            retry: RetryPolicy::default(),
            workspace_root: PathBuf::from("."),
            store_root: PathBuf::from(".image-ingest"),
            object_prefix: "analysis/".to_string(),
            git_ref: "refs/heads/main".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults
    ///
    /// # Errors
    /// [`ConfigError::Parse`] on malformed input
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Load a TOML file
    ///
    /// # Errors
    /// [`ConfigError::Read`] or [`ConfigError::Parse`]
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Apply overrides from the process environment
    ///
    /// # Errors
    /// [`ConfigError::InvalidEnv`] for unparsable numbers or prefixes
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup` (the environment, or a map in tests)
    ///
    /// # Errors
    /// [`ConfigError::InvalidEnv`] for unparsable numbers or prefixes
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let invalid = |name: &str, value: &str| ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
        };

        if let Some(v) = lookup("INGEST_REGION") {
            self.region = v;
        }
        if let Some(v) = lookup("INGEST_BUCKET") {
            self.bucket = v;
        }
        if let Some(v) = lookup("INGEST_TABLE") {
            self.table = v;
        }
        if let Some(v) = lookup("INGEST_STORE_ROOT") {
            self.store_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("INGEST_WORKSPACE") {
            self.workspace_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("INGEST_WATCH_PREFIX") {
            self.watch_prefix = WatchedPrefix::new(&v).map_err(|_| invalid("INGEST_WATCH_PREFIX", &v))?;
        }
        if let Some(v) = lookup("INGEST_WORKERS") {
            self.workers = v.trim().parse().map_err(|_| invalid("INGEST_WORKERS", &v))?;
        }
        if let Some(v) = lookup("INGEST_MAX_IMAGE_BYTES") {
            self.max_image_bytes = v
                .trim()
                .parse()
                .map_err(|_| invalid("INGEST_MAX_IMAGE_BYTES", &v))?;
        }
        if let Some(v) = lookup("GITHUB_REF") {
            if !v.trim().is_empty() {
                self.git_ref = v;
            }
        }
        Ok(self)
    }

    /// Check semantic constraints
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the first violated constraint
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.bucket.trim().is_empty() {
            return invalid("bucket must not be empty");
        }
        if self.table.trim().is_empty() {
            return invalid("table must not be empty");
        }
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.max_image_bytes == 0 {
            return invalid("max_image_bytes must be positive");
        }
        if self.analysis_timeout_ms == 0 {
            return invalid("analysis_timeout_ms must be positive");
        }
        if self.claim_ttl_secs == 0 {
            return invalid("claim_ttl_secs must be positive");
        }
        if self.image_filter().extensions().is_empty() {
            return invalid("at least one image extension is required");
        }
        Ok(())
    }

    /// With bucket
    #[inline]
    #[must_use]
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// With table
    #[inline]
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// With analysis timeout
    #[inline]
    #[must_use]
    pub fn with_analysis_timeout(mut self, timeout: Duration) -> Self {
        self.analysis_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With claim lease
    #[inline]
    #[must_use]
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl_secs = ttl.as_secs();
        self
    }

    /// With size gate
    #[inline]
    #[must_use]
    pub fn with_max_image_bytes(mut self, max: u64) -> Self {
        self.max_image_bytes = max;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_store_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.store_root = root.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_git_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = git_ref.into();
        self
    }

    /// Filter built from prefix and extensions
    #[must_use]
    pub fn image_filter(&self) -> ImageFilter {
        ImageFilter::new(self.watch_prefix.clone(), &self.extensions)
    }

    #[inline]
    #[must_use]
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    #[inline]
    #[must_use]
    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// Branch name derived from [`Self::git_ref`]
    #[inline]
    #[must_use]
    pub fn branch(&self) -> String {
        ingest_asset::branch_from_ref(&self.git_ref)
    }
}
