// Bounded admission gate for running items
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use tokio::sync::Notify;

use crate::error::{AppError, Result};
use crate::models::{ConcurrencyInfo, DEFAULT_CONCURRENCY};

/// Hard ceiling for the configurable limit
pub const MAX_CONCURRENCY_CEILING: usize = 64;

/// Counts running items against a live-adjustable limit.
///
/// `try_admit` is the only way to take a slot and the returned permit is
/// the only way to give it back, so the count can't drift.
#[derive(Debug)]
pub struct AdmissionController {
    max: AtomicUsize,
    active: AtomicUsize,
    released: Notify,
}

/// Reject limits outside 1..=64
pub fn check_limit(max: i64) -> Result<usize> {
    if max < 1 || max > MAX_CONCURRENCY_CEILING as i64 {
        return Err(AppError::Config(format!(
            "max concurrency must be between 1 and {}",
            MAX_CONCURRENCY_CEILING
        )));
    }
    Ok(max as usize)
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl AdmissionController {
    /// Out-of-range limits are clamped into 1..=64
    pub fn new(max: usize) -> Self {
        Self {
            max: AtomicUsize::new(max.clamp(1, MAX_CONCURRENCY_CEILING)),
            active: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    /// Change the limit. Lowering it never preempts running items; they
    /// simply finish before new ones are admitted.
    pub fn set_limit(&self, max: i64) -> Result<usize> {
        let max = check_limit(max)?;
        let previous = self.max.swap(max, Ordering::SeqCst);
        if previous != max {
            info!("Concurrency limit changed: {} -> {}", previous, max);
        }
        // Raising the limit frees slots for anyone waiting
        self.released.notify_waiters();
        Ok(max)
    }

    /// Take a slot if one is free right now
    pub fn try_admit(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut current = self.active.load(Ordering::SeqCst);
        loop {
            if current >= self.max.load(Ordering::SeqCst) {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        controller: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.released.notify_waiters();
    }

    /// Resolves after the next release or limit change
    pub async fn released(&self) {
        self.released.notified().await;
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ConcurrencyInfo {
        ConcurrencyInfo {
            active: self.active(),
            max: self.max(),
        }
    }
}

/// One admitted slot; dropping it releases the slot
#[derive(Debug)]
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release();
    }
}
