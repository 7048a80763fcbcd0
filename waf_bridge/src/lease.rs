//! Lease fence guarding a shared resource against teardown while in use.
//!
//! Readers take a lease before touching the resource and return it when
//! done. Closing flips a one-way flag that refuses new leases, then waits
//! for the outstanding ones to drain.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct FenceState {
    leases: usize,
    closing: bool,
}

#[derive(Debug, Default)]
pub struct LeaseFence {
    state: Mutex<FenceState>,
    drained: Condvar,
}

impl LeaseFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a lease unless the fence is closing.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.closing {
            return false;
        }
        state.leases += 1;
        true
    }

    /// Returns a lease taken with [`try_acquire`](Self::try_acquire).
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 && state.closing {
            self.drained.notify_all();
        }
    }

    /// Refuses new leases and blocks until every outstanding lease has been
    /// returned. Returns true for the call that started the close.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.closing;
        state.closing = true;
        while state.leases > 0 {
            self.drained.wait(&mut state);
        }
        first
    }

    /// Refuses new leases without waiting. Returns true when no lease is
    /// outstanding.
    pub fn mark_closing(&self) -> bool {
        let mut state = self.state.lock();
        state.closing = true;
        state.leases == 0
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn active(&self) -> usize {
        self.state.lock().leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_acquire_refused_after_close() {
        let fence = LeaseFence::new();
        assert!(fence.try_acquire());
        fence.release();
        assert!(fence.close());
        assert!(!fence.try_acquire());
        assert!(!fence.close());
    }

    #[test]
    fn test_close_waits_for_leases() {
        let fence = Arc::new(LeaseFence::new());
        assert!(fence.try_acquire());

        let closed = Arc::new(AtomicBool::new(false));
        let closer = {
            let fence = Arc::clone(&fence);
            let closed = Arc::clone(&closed);
            thread::spawn(move || {
                fence.close();
                closed.store(true, Ordering::SeqCst);
            })
        };

        while !fence.is_closing() {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!closed.load(Ordering::SeqCst));
        assert!(!fence.try_acquire());

        fence.release();
        closer.join().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(fence.active(), 0);
    }

    #[test]
    fn test_mark_closing_reports_outstanding_leases() {
        let fence = LeaseFence::new();
        assert!(fence.try_acquire());
        assert!(!fence.mark_closing());
        fence.release();
        assert!(fence.mark_closing());
    }
}
