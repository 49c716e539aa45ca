//! Worker pool - bounds how many sandboxes run at once.
//!
//! Permits come from a FIFO-fair tokio `Semaphore`. Gradings that cannot get
//! a permit immediately wait in a bounded queue; once the queue is full new
//! arrivals are refused instead of piling up.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("grading queue is full ({max_queued} requests already waiting)")]
    QueueFull { max_queued: usize },
    #[error("worker pool is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    max_concurrent: usize,
    max_queued: usize,
}

/// Held while a grading waits for a permit; leaving the queue on drop
struct QueueSlot {
    waiting: Arc<AtomicUsize>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            waiting: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
            max_queued,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for a sandbox slot. The permit is released when dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }

        let _slot = self.enter_queue()?;
        debug!(waiting = self.waiting(), "Waiting for a sandbox slot");

        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)
    }

    fn enter_queue(&self) -> Result<QueueSlot, PoolError> {
        let mut current = self.waiting.load(Ordering::SeqCst);
        loop {
            if current >= self.max_queued {
                return Err(PoolError::QueueFull {
                    max_queued: self.max_queued,
                });
            }
            match self
                .waiting
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        Ok(QueueSlot {
            waiting: self.waiting.clone(),
        })
    }

    /// Refuse all current and future waiters
    pub fn close(&self) {
        self.permits.close();
    }
}
