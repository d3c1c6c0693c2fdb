//! Bounded-concurrency admission in front of the engine
//!
//! A request must hold an [`AdmissionPermit`] before it touches the engine.
//! Permits release their slot when dropped, so every exit path (completion,
//! engine failure, cancellation, a dropped future) returns exactly one slot.

use llmops_common::{LlmOpsError, Result, METRICS};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Lock-free counters readable without touching the semaphore
#[derive(Debug, Default)]
struct SlotCounters {
    load: AtomicUsize,
    waiting: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Point-in-time view of slot accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub capacity: usize,
    /// Requests holding a slot
    pub load: usize,
    /// Requests blocked in `acquire`
    pub waiting: usize,
    pub acquired: u64,
    pub released: u64,
}

/// Fixed-capacity gate; no fairness guarantee between waiters
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<SlotCounters>,
}

impl AdmissionController {
    /// Create a controller with `capacity` slots
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(LlmOpsError::config("admission capacity must be at least 1"));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(SlotCounters::default()),
        })
    }

    /// Wait for a free slot and reserve it
    ///
    /// Fails only with [`LlmOpsError::Shutdown`] once [`close`](Self::close)
    /// has been called.
    pub async fn acquire(&self) -> Result<AdmissionPermit> {
        let start = Instant::now();
        let _waiting = WaitingGuard::enter(&self.counters);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LlmOpsError::Shutdown)?;

        let load = self.counters.load.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        METRICS.worker.current_load.inc();
        METRICS
            .worker
            .admission_wait
            .observe(start.elapsed().as_secs_f64());

        debug!("Admission slot acquired, load {}/{}", load, self.capacity);

        Ok(AdmissionPermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Reject all current and future waiters
    pub fn close(&self) {
        info!("Closing admission controller");
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Requests currently holding a slot
    pub fn load(&self) -> usize {
        self.counters.load.load(Ordering::SeqCst)
    }

    /// Requests currently waiting for a slot
    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.capacity,
            load: self.load(),
            waiting: self.waiting(),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
        }
    }
}

/// A reserved slot; dropping it releases the slot
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        // Runs before the semaphore permit field is dropped, so `load`
        // never exceeds capacity
        self.counters.load.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::Relaxed);
        METRICS.worker.current_load.dec();
    }
}

/// Counts a waiter for as long as `acquire` is pending, including when the
/// acquiring future is dropped
struct WaitingGuard<'a> {
    counters: &'a SlotCounters,
}

impl<'a> WaitingGuard<'a> {
    fn enter(counters: &'a SlotCounters) -> Self {
        counters.waiting.fetch_add(1, Ordering::SeqCst);
        METRICS.worker.waiting_requests.inc();
        Self { counters }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counters.waiting.fetch_sub(1, Ordering::SeqCst);
        METRICS.worker.waiting_requests.dec();
    }
}
