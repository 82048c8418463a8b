//! Session implementation of BusContext backed by the system clock.

use crate::BusContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Session context backed by the OS clock.
///
/// This is the "real" implementation used when the harness drives live
/// subjects. Pauses are short real sleeps so threads posting replies from
/// I/O adapters get a chance to run.
pub struct SystemContext {
    /// Start time for monotonic duration calculations
    start: Instant,

    /// Log ordering counter
    order: AtomicU64,

    /// Length of one cooperative pause
    poll_interval: Duration,
}

impl SystemContext {
    /// Creates a new SystemContext with a 1ms poll interval.
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(1))
    }

    /// Creates a context pausing for `poll_interval` between drain passes.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            order: AtomicU64::new(0),
            poll_interval,
        }
    }

    /// Creates an Arc-wrapped context for sharing with the Farm.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for SystemContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BusContext for SystemContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::SeqCst)
    }

    fn pause(&self) {
        std::thread::sleep(self.poll_interval);
    }

    fn seed(&self) -> u64 {
        // Session runs are not seeded
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_context_time() {
        let ctx = SystemContext::new();
        let t1 = ctx.now();
        ctx.pause();
        let t2 = ctx.now();

        assert!(t2 > t1);
        assert!(t2 - t1 >= Duration::from_millis(1));
    }

    #[test]
    fn test_system_context_order_increases() {
        let ctx = SystemContext::new();
        let a = ctx.next_order();
        let b = ctx.next_order();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_system_context_seed() {
        let ctx = SystemContext::new();
        assert_eq!(ctx.seed(), 0);
    }
}
