//! Live allocation accounting shared by the engine and its callers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

/// Counts outstanding engine allocations: string and key buffers, container
/// blocks, ruleset instances and evaluation contexts.
///
/// Clones share the same counter. Every `acquire` must be paired with exactly
/// one `release`; a balanced program ends with `live() == 0`.
#[derive(Debug, Clone, Default)]
pub struct AllocationTracker {
    live: Arc<AtomicI64>,
}

impl AllocationTracker {
    /// Creates a tracker with its own counter, independent of [`global`](Self::global).
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide tracker used when no tracker is injected.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<AllocationTracker> = OnceLock::new();
        GLOBAL.get_or_init(AllocationTracker::new).clone()
    }

    pub fn acquire(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub fn release(&self) {
        let previous = self.live.fetch_sub(1, Ordering::Relaxed);
        if previous <= 0 {
            log::error!(
                "allocation released without a matching acquire (live count now {})",
                previous - 1
            );
        }
    }

    /// Number of allocations acquired and not yet released.
    pub fn live(&self) -> i64 {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_balanced(&self) -> bool {
        self.live() == 0
    }

    /// True when both handles count into the same counter.
    pub fn shares_counter_with(&self, other: &AllocationTracker) -> bool {
        Arc::ptr_eq(&self.live, &other.live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_balances() {
        let tracker = AllocationTracker::new();
        tracker.acquire();
        tracker.acquire();
        assert_eq!(tracker.live(), 2);
        tracker.release();
        tracker.release();
        assert!(tracker.is_balanced());
    }

    #[test]
    fn test_clones_share_counter() {
        let tracker = AllocationTracker::new();
        let clone = tracker.clone();
        clone.acquire();
        assert_eq!(tracker.live(), 1);
        assert!(tracker.shares_counter_with(&clone));
        assert!(!tracker.shares_counter_with(&AllocationTracker::new()));
        clone.release();
    }

    #[test]
    fn test_global_is_shared() {
        assert!(AllocationTracker::global().shares_counter_with(&AllocationTracker::global()));
    }
}
