//! Core environment context trait for the bus engine.

use std::time::{Duration, SystemTime};

/// The central interface for environment interaction.
///
/// Replaces process-wide singletons (the log ordering counter, the wall
/// clock) with an explicit object created once per Farm and handed to
/// every channel and component that needs it.
///
/// # Implementations
///
/// - **Session**: `SystemContext` - monotonic `Instant`, short real sleeps
/// - **Deterministic**: `ManualContext` - virtual clock advanced by the test
///   or by each cooperative pause
pub trait BusContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Reply deadlines are absolute values on this clock.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used in conversation records.
    fn system_time(&self) -> SystemTime;

    /// Returns the next value of the log ordering counter.
    ///
    /// Strictly increasing for the lifetime of the context.
    fn next_order(&self) -> u64;

    /// Yields between drain passes while replies are still outstanding.
    ///
    /// Never blocks for long: the drain loop must keep polling mailboxes
    /// and evaluating deadlines.
    fn pause(&self);

    /// Returns the context's seed (0 when not seeded).
    fn seed(&self) -> u64;
}
