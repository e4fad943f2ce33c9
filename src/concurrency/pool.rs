//! Bounded admission for execution requests.
//!
//! Requests beyond the worker count wait in FIFO order on a tokio
//! semaphore. Counters are exposed for status reporting.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("worker pool is closed")]
pub struct PoolClosed;

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
}

pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
    counters: Arc<Counters>,
}

/// Slot in the pool. Dropping it frees the slot and counts the request as
/// completed.
pub struct Admission {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.completed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Keeps `queued` accurate if the waiting future is cancelled.
struct Queued<'a>(&'a Counters);

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Result<Admission, PoolClosed> {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let queued = Queued(&self.counters);
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolClosed)?;
        drop(queued);

        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Admission {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            queued: self.counters.queued.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }
}
