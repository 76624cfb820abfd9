//! Worker Pool
//!
//! Bounds the number of simultaneously running worker processes. Requests
//! beyond the limit wait for a permit instead of spawning unboundedly.

use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool usage counters
#[derive(Debug, Default)]
struct PoolMetrics {
    in_flight: AtomicUsize,
    queued: AtomicUsize,
    peak_in_flight: AtomicUsize,
    admitted_total: AtomicU64,
}

/// Semaphore-gated admission for worker invocations
#[derive(Debug, Clone)]
pub struct WorkerPool {
    capacity: usize,
    metrics: Arc<PoolMetrics>,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        // a zero-capacity pool would park every request forever
        let capacity = capacity.max(1);

        Self {
            capacity,
            metrics: Arc::new(PoolMetrics::default()),
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot. Excess callers queue here.
    pub async fn acquire(&self) -> Result<WorkerPermit> {
        let _waiting = QueueGuard::enter(self.metrics.clone());

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PipelineError::Internal(format!("Worker pool closed: {}", e)))?;

        Ok(WorkerPermit::admit(permit, self.metrics.clone()))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            in_flight: self.metrics.in_flight.load(Ordering::Relaxed),
            queued: self.metrics.queued.load(Ordering::Relaxed),
            peak_in_flight: self.metrics.peak_in_flight.load(Ordering::Relaxed),
            admitted_total: self.metrics.admitted_total.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard that releases the worker slot on drop
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
    metrics: Arc<PoolMetrics>,
}

impl WorkerPermit {
    fn admit(permit: OwnedSemaphorePermit, metrics: Arc<PoolMetrics>) -> Self {
        let now = metrics.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        metrics.admitted_total.fetch_add(1, Ordering::Relaxed);
        crate::metrics::WORKERS_IN_FLIGHT.inc();

        Self {
            _permit: permit,
            metrics,
        }
    }
}

impl Drop for WorkerPermit {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::WORKERS_IN_FLIGHT.dec();
    }
}

/// Counts a caller as queued for as long as it waits, including when the
/// waiting request is cancelled.
struct QueueGuard {
    metrics: Arc<PoolMetrics>,
}

impl QueueGuard {
    fn enter(metrics: Arc<PoolMetrics>) -> Self {
        metrics.queued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::WORKERS_QUEUED.inc();
        Self { metrics }
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.metrics.queued.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::WORKERS_QUEUED.dec();
    }
}

/// Worker pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub peak_in_flight: usize,
    pub admitted_total: u64,
}

impl PoolStats {
    pub fn utilization_percent(&self) -> f64 {
        self.in_flight as f64 / self.capacity as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_limit() {
        let pool = WorkerPool::new(2);

        let _guard1 = pool.acquire().await.unwrap();
        let _guard2 = pool.acquire().await.unwrap();

        // Third has to wait
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(third.is_err());

        drop(_guard1);

        // Now should succeed
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_excess_callers_wait_instead_of_failing() {
        let pool = WorkerPool::new(1);
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().queued, 1);
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();

        let stats = pool.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 1);
        assert_eq!(stats.admitted_total, 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_clamped() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.capacity(), 1);
        let permit = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_utilization() {
        let pool = WorkerPool::new(4);
        let _a = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().utilization_percent(), 25.0);
    }
}
