//! Process-wide byte budget consulted by every growable region.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Grants and reclaims byte budgets through an atomic counter.
///
/// A request that would push usage past the budget fails without changing
/// any state, so callers can roll back their own bookkeeping.
#[derive(Debug)]
pub struct MemoryManager {
    /// Upper bound on outstanding bytes.
    max_bytes: usize,
    /// Bytes currently granted.
    used_bytes: AtomicUsize,
}

impl MemoryManager {
    /// Creates a manager with the given budget. A budget of 0 means unlimited.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: if max_bytes == 0 { usize::MAX } else { max_bytes },
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// Creates a manager without a budget.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Reserves `bytes`. Returns false if the budget would be exceeded.
    pub fn allocate(&self, bytes: usize) -> bool {
        let mut current = self.used_bytes.load(Ordering::Relaxed);
        loop {
            let requested = match current.checked_add(bytes) {
                Some(total) if total <= self.max_bytes => total,
                _ => {
                    warn!(
                        requested = bytes,
                        used = current,
                        max = self.max_bytes,
                        "memory budget exhausted"
                    );
                    return false;
                }
            };
            match self.used_bytes.compare_exchange_weak(
                current,
                requested,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `bytes` to the budget.
    pub fn deallocate(&self, bytes: usize) {
        let previous = self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "deallocated more than allocated");
    }

    /// Returns the configured budget in bytes.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns the bytes currently granted.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Returns the bytes still available.
    pub fn available_bytes(&self) -> usize {
        self.max_bytes.saturating_sub(self.used_bytes())
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::unlimited()
    }
}
