//! image-ingest storage layer
//!
//! The three shared resources a pipeline run talks to:
//!
//! - [`ClaimStore`]: per (asset, commit) [`ProcessingRecord`]s, mutated only
//!   through atomic conditional writes. The sole synchronization point
//!   between concurrent runs.
//! - [`ObjectStore`]: raw analysis payloads, one object per asset version.
//! - [`ResultTable`]: one queryable [`TableRow`] per asset.
//!
//! Each trait has an in-memory backend (tests, single process) and a
//! filesystem backend under [`fs`] that several processes may share.
//!
//! # Example
//!
//! ```rust
//! use ingest_asset::{AssetKey, CommitSha};
//! use ingest_store::{ClaimKey, ClaimStore, MemoryClaimStore, RecordState, RunId};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let store = MemoryClaimStore::new();
//! let key = ClaimKey::new(
//!     AssetKey::new("images/cat.png").unwrap(),
//!     CommitSha::new("abcdef1").unwrap(),
//! );
//! let run = RunId::new();
//!
//! store.try_claim(&key, run, Duration::from_secs(60)).await.unwrap();
//! assert!(store.try_claim(&key, RunId::new(), Duration::from_secs(60)).await.is_err());
//!
//! let done = store.complete(&key, run).await.unwrap();
//! assert_eq!(done.state, RecordState::Succeeded);
//! # });
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod claims;
mod error;
pub mod fs;
mod objects;
mod record;
mod table;

pub use claims::{ClaimStore, MemoryClaimStore};
pub use error::{ClaimError, StoreError};
pub use fs::{FsClaimStore, FsObjectStore, FsResultTable};
pub use objects::{MemoryObjectStore, ObjectKey, ObjectStore};
pub use record::{
    allowed_transitions, validate_transition, ClaimDecision, ClaimKey, ProcessingRecord,
    RecordState, RunId,
};
pub use table::{Label, MemoryResultTable, ResultStatus, ResultTable, TableRow};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
