//! image-ingest asset primitives
//!
//! Identity and filtering for image assets flowing through the pipeline.
//!
//! # Core Concepts
//!
//! - [`AssetKey`]: normalized repository path, the idempotency key
//! - [`CommitSha`]: commit the asset was merged in
//! - [`WatchedPrefix`] / [`ImageFilter`]: which changed paths are analyzed
//! - [`ContentHash`]: 32-byte Blake3 digest of an image payload
//!
//! # Example
//!
//! ```rust
//! use ingest_asset::{AssetKey, ImageFilter};
//!
//! let filter = ImageFilter::default();
//! let key = filter.accept("./images/cat.png").unwrap();
//! assert_eq!(key, AssetKey::new("images/cat.png").unwrap());
//! assert!(filter.accept("docs/readme.md").is_none());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod commit;
mod filter;
mod hash;
mod key;

pub use commit::{branch_from_ref, CommitError, CommitSha};
pub use filter::{ImageFilter, WatchedPrefix, DEFAULT_IMAGE_EXTENSIONS};
pub use hash::{ContentHash, HashError};
pub use key::{normalize_repo_path, AssetKey, PathError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
