//! Admission control for concurrent transcodes.
//!
//! A fixed number of slots backed by a tokio `Semaphore`, whose waiters are
//! served in FIFO order. Timeouts are not handled here; a slot is held for as
//! long as the pipeline that owns it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::metrics;

/// Bounds the number of transcodes running at once.
#[derive(Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
    waiting: Arc<AtomicUsize>,
}

impl AdmissionController {
    /// `limit` is clamped to at least 1.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
            in_flight: Arc::new(AtomicUsize::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Callers queued for a slot.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Waits for a free slot. The slot is released when the returned guard drops.
    pub async fn acquire(&self) -> AdmissionSlot {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        metrics::ADMISSION_QUEUED.inc();
        let queued = WaitGuard(Arc::clone(&self.waiting));

        // the semaphore is never closed
        #[allow(clippy::expect_used)]
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("admission semaphore closed");
        drop(queued);

        let active = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::TRANSCODES_ACTIVE.inc();
        log::debug!("Admission slot acquired ({}/{})", active, self.limit);

        AdmissionSlot {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Runs `f` while holding a slot.
    pub async fn with_slot<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _slot = self.acquire().await;
        f().await
    }
}

/// Undoes the queued count even when the waiting future is cancelled.
struct WaitGuard(Arc<AtomicUsize>);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
        metrics::ADMISSION_QUEUED.dec();
    }
}

/// A held admission slot.
pub struct AdmissionSlot {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        metrics::TRANSCODES_ACTIVE.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limit_is_at_least_one() {
        assert_eq!(AdmissionController::new(0).limit(), 1);
    }

    #[tokio::test]
    async fn test_at_most_k_in_flight() {
        let admission = AdmissionController::new(2);
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let admission = admission.clone();
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    admission
                        .with_slot(|| async {
                            peak.fetch_max(admission.in_flight(), Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(admission.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let admission = AdmissionController::new(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = admission.acquire().await;

        let mut tasks = Vec::new();
        for i in 0..4 {
            let waiter = admission.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _slot = waiter.acquire().await;
                order.lock().push(i);
            }));
            // make sure each waiter is queued before the next one
            while admission.waiting() < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_no_trace() {
        let admission = AdmissionController::new(1);
        let _held = admission.acquire().await;

        let waiting = tokio::time::timeout(Duration::from_millis(20), admission.acquire()).await;
        assert!(waiting.is_err());
        assert_eq!(admission.waiting(), 0);
    }
}
