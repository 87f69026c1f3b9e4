//! Atomic file primitives shared by the filesystem backends
//!
//! - [`write_atomic`]: temp file + rename, readers never see a torn write
//! - [`KeyLock`]: per-key mutex backed by an O_EXCL lock file holding an
//!   owner token, so separate processes sharing a store directory serialize
//!   their updates

use crate::error::StoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

/// Lock files older than this are assumed abandoned by a crashed process
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

const LOCK_POLL: Duration = Duration::from_millis(5);

/// Write `bytes` to `path` via a sibling temp file and rename
///
/// # Errors
/// Returns [`StoreError::Io`] on any filesystem failure
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;
    }

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Read a file, mapping "not found" to `None`
///
/// # Errors
/// Returns [`StoreError::Io`] for other failures
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Remove a file, returning whether it existed
///
/// # Errors
/// Returns [`StoreError::Io`] for failures other than "not found"
pub async fn remove_optional(path: &Path) -> Result<bool, StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Check whether a file name belongs to an in-flight atomic write
#[inline]
#[must_use]
pub fn is_temp_name(name: &str) -> bool {
    name.contains(".tmp-")
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.tmp-{}", Ulid::new()))
}

/// Held per-key lock; the lock file is removed on drop if it is still ours
#[derive(Debug)]
pub struct KeyLock {
    path: PathBuf,
    token: Ulid,
}

impl KeyLock {
    /// Acquire the lock at `path`, polling until `timeout`
    ///
    /// # Errors
    /// - [`StoreError::LockTimeout`] if another holder keeps it past `timeout`
    /// - [`StoreError::Io`] on filesystem failure
    pub async fn acquire(path: PathBuf, timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        let token = Ulid::new();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let lock = Self { path, token };
                    file.write_all(token.to_string().as_bytes())
                        .await
                        .map_err(|e| StoreError::io(&lock.path, e))?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(owner) = Self::stale_owner(&path).await {
                        Self::break_stale(&path, &owner).await?;
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StoreError::LockTimeout(path.display().to_string()));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            }
        }
    }

    /// Token written into the lock file
    #[inline]
    #[must_use]
    pub fn token(&self) -> Ulid {
        self.token
    }

    /// Contents of the lock file at `path` if it is older than [`STALE_LOCK_AGE`]
    async fn stale_owner(path: &Path) -> Option<String> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        let age = SystemTime::now().duration_since(meta.modified().ok()?).ok()?;
        if age <= STALE_LOCK_AGE {
            return None;
        }
        tokio::fs::read_to_string(path).await.ok()
    }

    /// Move a stale lock aside so only one breaker wins
    ///
    /// The rename is atomic; a loser sees `NotFound` and retries the create.
    /// If the file moved aside is not the one judged stale, a new holder took
    /// the lock in between and it is linked back into place.
    async fn break_stale(path: &Path, owner: &str) -> Result<(), StoreError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = path.with_file_name(format!("{name}.stale-{}", Ulid::new()));

        match tokio::fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(path, e)),
        }

        let moved = tokio::fs::read_to_string(&aside).await.unwrap_or_default();
        if moved == owner {
            tracing::warn!(lock = %path.display(), owner = %owner, "broke stale lock");
        } else {
            tracing::warn!(lock = %path.display(), "lock changed hands while breaking, restoring");
            if let Err(e) = tokio::fs::hard_link(&aside, path).await {
                tracing::warn!(lock = %path.display(), error = %e, "could not restore lock");
            }
        }
        remove_optional(&aside).await?;
        Ok(())
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token.to_string() => {
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => {
                tracing::warn!(lock = %self.path.display(), "lock was broken by another holder");
            }
            Err(_) => {}
        }
    }
}
