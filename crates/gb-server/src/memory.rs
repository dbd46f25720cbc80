//! Process-wide budget for request decode buffers.
//!
//! The frame reader prechecks the budget as soon as a frame header is
//! decoded, then actually reserves at the moment the frame is complete.
//! Reservations release on drop, so every exit path gives the bytes back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A counter of bytes currently committed to in-flight request buffers.
///
/// A zero capacity disables the limit.
pub struct MemoryBudget {
    capacity: u64,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn new(capacity: u64) -> Arc<MemoryBudget> {
        Arc::new(MemoryBudget {
            capacity,
            used: AtomicU64::new(0),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Non-reserving check, used to short-circuit hostile floods before the
    /// whole payload has been read.
    pub fn has_free(&self, bytes: u64) -> bool {
        self.capacity == 0 || self.used().saturating_add(bytes) <= self.capacity
    }

    /// Commit `bytes` to the budget.  Fails when the capacity would be
    /// exceeded; the precheck may have passed a while ago.
    pub fn try_reserve(self: &Arc<MemoryBudget>, bytes: u64) -> Option<MemoryReservation> {
        if self.capacity > 0 {
            let mut current = self.used.load(Ordering::Relaxed);
            loop {
                let next = current.checked_add(bytes)?;
                if next > self.capacity {
                    return None;
                }
                match self.used.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        Some(MemoryReservation {
            budget: Arc::clone(self),
            bytes,
        })
    }
}

/// RAII handle over reserved bytes.
pub struct MemoryReservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        if self.budget.capacity > 0 {
            self.budget.used.fetch_sub(self.bytes, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_balance() {
        let budget = MemoryBudget::new(100);
        let a = budget.try_reserve(60).unwrap();
        assert_eq!(budget.used(), 60);
        assert!(!budget.has_free(50));
        assert!(budget.try_reserve(50).is_none());
        let b = budget.try_reserve(40).unwrap();
        assert_eq!(budget.used(), 100);
        drop(a);
        assert_eq!(budget.used(), 40);
        drop(b);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn zero_capacity_means_unlimited() {
        let budget = MemoryBudget::new(0);
        assert!(budget.has_free(u64::MAX));
        let r = budget.try_reserve(u64::MAX).unwrap();
        assert_eq!(budget.used(), 0);
        drop(r);
    }
}
