//! Process-wide bound on simultaneous source lookups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Counting limiter shared by every refresh issued through one cache.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    bound: usize,
}

/// One occupied slot. Dropping it releases the slot, so release happens on
/// every exit path, including unwinding and task cancellation.
#[derive(Debug)]
pub struct RefreshPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for RefreshPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(bound: usize) -> Self {
        let bound = bound.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(bound)),
            active: Arc::new(AtomicUsize::new(0)),
            bound,
        }
    }

    /// Wait for a free slot. Suspends only the calling task.
    ///
    /// Returns `None` once the limiter has been closed.
    pub async fn acquire(&self) -> Option<RefreshPermit> {
        let permit = self.semaphore.clone().acquire_owned().await.ok()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(RefreshPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Refuse all further acquisitions (shutdown). Held permits stay valid.
    pub fn close(&self) {
        self.semaphore.close();
        info!("Concurrency limiter closed, no new lookups will start");
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_CONCURRENT_REFRESHES)
    }
}
