//! Production implementation of [`Clock`] backed by `std::time::Instant`.

use crate::clock::Clock;
use crate::types::Timestamp;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Real-time clock shared across a session.
///
/// Elapsed time is kept as `accumulated + (now - started)` so that
/// stop/start pairs pause the counter like a stopwatch.
pub struct NetClock {
    state: Mutex<ClockState>,
}

struct ClockState {
    /// Whether the stopwatch is counting
    running: bool,

    /// Instant of the last start/restart
    started: Instant,

    /// Time counted before the last start
    accumulated: Duration,

    /// Added to every read
    offset: Timestamp,
}

impl ClockState {
    fn elapsed(&self) -> Duration {
        if self.running {
            self.accumulated + self.started.elapsed()
        } else {
            self.accumulated
        }
    }
}

impl NetClock {
    /// Creates a stopped clock reading zero.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClockState {
                running: false,
                started: Instant::now(),
                accumulated: Duration::ZERO,
                offset: 0,
            }),
        }
    }

    /// Creates an Arc-wrapped clock that is already counting.
    pub fn started() -> Arc<Self> {
        let clock = Self::new();
        clock.start();
        Arc::new(clock)
    }

    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for NetClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for NetClock {
    fn now(&self) -> Timestamp {
        let state = self.lock();
        // Truncation is intended: timestamps wrap like the wire field.
        (state.elapsed().as_millis() as i64 as Timestamp).wrapping_add(state.offset)
    }

    fn start(&self) {
        let mut state = self.lock();
        if !state.running {
            state.started = Instant::now();
            state.running = true;
        }
    }

    fn stop(&self) {
        let mut state = self.lock();
        if state.running {
            let elapsed = state.started.elapsed();
            state.accumulated += elapsed;
            state.running = false;
        }
    }

    fn restart(&self, offset: Timestamp) {
        let mut state = self.lock();
        state.accumulated = Duration::ZERO;
        state.started = Instant::now();
        state.running = true;
        state.offset = offset;
    }

    fn is_running(&self) -> bool {
        self.lock().running
    }
}
