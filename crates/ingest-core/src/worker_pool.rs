//! Bounded worker pool for per-asset jobs
//!
//! Provides:
//! - Concurrency bound via a semaphore (at most `max_workers` jobs running)
//! - Results returned in submission order
//! - Pool statistics and monitoring

use crate::error::PoolError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::Instrument;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Jobs handed to the pool
    pub submitted: usize,
    /// Jobs that returned
    pub completed: usize,
    /// Jobs that panicked
    pub panicked: usize,
    /// Currently running jobs
    pub active: usize,
    /// Highest concurrent job count observed
    pub peak_active: usize,
}

/// Runs async jobs with bounded concurrency
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<PoolStats>>,
}

impl WorkerPool {
    /// Create new pool (at least one worker)
    #[inline]
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    #[inline]
    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `job` over every item; output order matches input order
    ///
    /// # Errors
    /// [`PoolError::WorkerPanicked`] if any job panicked (the remaining
    /// jobs still run to completion first)
    pub async fn run_all<I, T, F, Fut>(&self, items: Vec<I>, job: F) -> Result<Vec<T>, PoolError>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let job = Arc::new(job);
        let mut set = JoinSet::new();
        let total = items.len();

        self.stats.lock().await.submitted += total;

        for (index, item) in items.into_iter().enumerate() {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?;
            let job = Arc::clone(&job);
            let stats = Arc::clone(&self.stats);

            {
                let mut s = stats.lock().await;
                s.active += 1;
                s.peak_active = s.peak_active.max(s.active);
            }

            set.spawn(
                async move {
                    let out = job(item).await;
                    drop(permit);
                    let mut s = stats.lock().await;
                    s.active -= 1;
                    s.completed += 1;
                    (index, out)
                }
                .in_current_span(),
            );
        }

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut first_panic = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, out)) => slots[index] = Some(out),
                Err(e) => {
                    let mut s = self.stats.lock().await;
                    s.panicked += 1;
                    s.active = s.active.saturating_sub(1);
                    first_panic.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(message) = first_panic {
            tracing::error!(error = %message, "worker panicked");
            return Err(PoolError::WorkerPanicked(message));
        }
        Ok(slots.into_iter().flatten().collect())
    }

    /// Get pool statistics
    pub async fn stats(&self) -> PoolStats {
        self.stats.lock().await.clone()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}
