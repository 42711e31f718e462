use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counts live client connections across all listeners and hands out ids
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    active: AtomicUsize,
    next_id: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new connection; the count drops again when the guard does
    pub fn open(self: &Arc<Self>) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        ConnectionGuard {
            tracker: Arc::clone(self),
            id,
            released: false,
        }
    }

    /// Get the current active connection count
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Connections accepted since startup
    pub fn total(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}

/// RAII guard to ensure the connection count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
    id: u64,
    released: bool,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Manually decrement the connection counter
    pub fn release(&mut self) {
        if !self.released {
            self.tracker.active.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
