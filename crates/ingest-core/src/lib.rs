//! image-ingest core pipeline
//!
//! Gated, idempotent ingestion of merged image assets:
//! - Resolves a merge event to the image assets it changed
//! - Claims each (asset, commit) pair so concurrent or duplicated runs never
//!   analyze the same asset twice
//! - Analyzes on a bounded worker pool with timeout and retry
//! - Writes the payload object then the lookup row, rolling back on failure
//! - Sweeps up after crashed runs
//!
//! # Example
//!
//! ```rust,no_run
//! use ingest_asset::CommitSha;
//! use ingest_core::{ChangeEvent, Pipeline, PipelineConfig, Stores};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::new().apply_env()?;
//! let pipeline = Pipeline::new(config.clone(), Stores::filesystem(&config))?;
//!
//! let event = ChangeEvent::new(CommitSha::new("4b825dc6a1e2f3b4c5d6e7f8091a2b3c4d5e6f70")?)
//!     .with_paths(["images/cat.png", "images/dog.png", "docs/readme.md"]);
//! let report = pipeline.run(&event).await?;
//!
//! std::process::exit(report.exit_code());
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod analyzer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod reconcile;
pub mod resolver;
pub mod retry;
pub mod stores;
pub mod types;
pub mod worker_pool;
pub mod writer;

pub use analyzer::{Analyzer, AssetSource, ImageInput, ImageProbeAnalyzer, WorkspaceSource};
pub use config::{PipelineConfig, RetryPolicy, DEFAULT_MAX_IMAGE_BYTES};
pub use dispatcher::{ClaimTicket, Dispatcher};
pub use error::{
    AnalysisError, ConfigError, PipelineError, PoolError, ResolutionError, Retryable,
    SourceError, WriteError,
};
pub use pipeline::Pipeline;
pub use reconcile::{Reconciler, SweepReport};
pub use resolver::{ChangeSetResolver, DiffSource, EventPaths, GitDiffSource};
pub use stores::{StoreStatus, Stores};
pub use types::{
    Analysis, AnalysisResult, AssetOutcome, AssetReport, ChangeEvent, OutcomeCounts,
    RejectReason, RunReport, SkipReason,
};
pub use worker_pool::{PoolStats, WorkerPool};
pub use writer::ResultWriter;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for wiring up a pipeline
    pub use crate::{
        Analysis, AnalysisError, Analyzer, AssetOutcome, ChangeEvent, ImageInput, Pipeline,
        PipelineConfig, RunReport, Stores,
    };
    pub use ingest_asset::{AssetKey, CommitSha};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
