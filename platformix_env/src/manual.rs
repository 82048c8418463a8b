//! Manually driven context for deterministic testing.

use crate::BusContext;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Context backed by a virtual clock.
///
/// This implements `BusContext` using:
/// - A virtual clock advanced by the test (`advance_time`)
/// - A cooperative pause that advances the clock by a fixed step, so reply
///   deadlines expire after a predictable number of drain passes
/// - A shared log ordering counter
pub struct ManualContext {
    /// Master seed for this run
    seed: u64,

    /// Current virtual time (nanoseconds since start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Virtual time consumed by one pause
    pause_step_ns: u64,

    /// Log ordering counter
    order: Arc<AtomicU64>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl ManualContext {
    /// Creates a new ManualContext with the given seed and a 10ms pause step.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            pause_step_ns: Duration::from_millis(10).as_nanos() as u64,
            order: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Sets how much virtual time one cooperative pause consumes.
    pub fn with_pause_step(mut self, step: Duration) -> Self {
        self.pause_step_ns = step.as_nanos() as u64;
        self
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += duration.as_nanos() as u64;
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time = time_ns;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap()
    }
}

impl Clone for ManualContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            pause_step_ns: self.pause_step_ns,
            order: Arc::clone(&self.order),
            epoch: self.epoch,
        }
    }
}

impl BusContext for ManualContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(*self.virtual_time_ns.lock().unwrap())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    fn next_order(&self) -> u64 {
        self.order.fetch_add(1, Ordering::SeqCst)
    }

    fn pause(&self) {
        // Pausing is how virtual time moves forward while the bus idles
        let mut time = self.virtual_time_ns.lock().unwrap();
        *time += self.pause_step_ns;
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_context_time() {
        let ctx = ManualContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));

        ctx.set_time(0);
        assert_eq!(ctx.time_ns(), 0);
    }

    #[test]
    fn test_manual_context_pause_advances() {
        let ctx = ManualContext::new(1).with_pause_step(Duration::from_millis(250));
        ctx.pause();
        ctx.pause();
        assert_eq!(ctx.now(), Duration::from_millis(500));
    }

    #[test]
    fn test_manual_context_clone_shares_time_and_order() {
        let ctx1 = ManualContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());

        let a = ctx1.next_order();
        let b = ctx2.next_order();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn test_manual_context_seed() {
        let ctx = ManualContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
        assert_eq!(ctx.system_time(), UNIX_EPOCH + Duration::from_secs(1704067200));
    }
}
