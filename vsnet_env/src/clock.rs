//! Shared millisecond clock used to time-stamp and interpret every update.

use crate::types::Timestamp;

/// A thread-safe monotonic millisecond counter with an adjustable offset.
///
/// The same clock instance is shared by the device registry (which restarts it
/// when a peer synchronizes us), every channel (which stamps outgoing headers)
/// and every QoS strategy (which compares buffered timestamps against `now`).
///
/// # Implementations
///
/// - **Production**: [`NetClock`](crate::NetClock) - wraps `std::time::Instant`
/// - **Simulation**: [`ManualClock`](crate::ManualClock) - virtual timeline advanced by hand
///
/// All operations on one instance are serialized by a single lock, so `now()`
/// may be called concurrently from the tick thread and receive threads.
pub trait Clock: Send + Sync + 'static {
    /// Returns elapsed milliseconds since the last restart, plus the offset.
    fn now(&self) -> Timestamp;

    /// Resumes counting. No-op if already running.
    fn start(&self);

    /// Pauses counting. No-op if already stopped.
    fn stop(&self);

    /// Resets elapsed time to zero, starts counting and stores `offset`
    /// to be added to subsequent reads.
    ///
    /// Used for clock-sync convergence (the peer's timestamp becomes our "now")
    /// and for replay-from-timestamp runs.
    fn restart(&self, offset: Timestamp);

    /// Returns true while the clock is counting.
    fn is_running(&self) -> bool;
}

/// Milliseconds elapsed from `earlier` to `later`, tolerant to wrap-around.
pub fn elapsed_between(earlier: Timestamp, later: Timestamp) -> Timestamp {
    later.wrapping_sub(earlier)
}

/// True once `now` has reached `at`, tolerant to wrap-around.
pub fn is_due(at: Timestamp, now: Timestamp) -> bool {
    elapsed_between(at, now) >= 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_between_wraps() {
        assert_eq!(elapsed_between(100, 130), 30);
        assert_eq!(elapsed_between(i32::MAX - 5, i32::MIN + 4), 10);
    }

    #[test]
    fn test_is_due_across_wrap() {
        assert!(is_due(100, 100));
        assert!(!is_due(101, 100));
        assert!(is_due(i32::MAX - 2, i32::MIN + 3));
        assert!(!is_due(i32::MIN + 3, i32::MAX - 2));
    }
}
