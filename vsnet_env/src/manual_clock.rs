//! Virtual clock implementing [`Clock`] for deterministic testing.

use crate::clock::Clock;
use crate::types::Timestamp;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Clock driven by a virtual timeline that only moves when told to.
///
/// Several clocks can share one timeline through [`ManualClock::fork`]: the
/// timeline is "true" time, while each fork keeps its own offset and restart
/// point, the same way independent devices keep independent clocks.
pub struct ManualClock {
    /// Shared virtual time in milliseconds
    timeline: Arc<Mutex<i64>>,

    /// This clock's stopwatch state over the timeline
    local: Mutex<LocalState>,
}

struct LocalState {
    running: bool,
    /// Timeline value at the last start/restart
    origin: i64,
    /// Milliseconds counted before the last start
    accumulated: i64,
    offset: Timestamp,
}

impl ManualClock {
    /// Creates a running clock on a fresh timeline starting at zero.
    pub fn new() -> Self {
        Self::on_timeline(Arc::new(Mutex::new(0)), 0)
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn on_timeline(timeline: Arc<Mutex<i64>>, offset: Timestamp) -> Self {
        let origin = *timeline.lock().unwrap_or_else(PoisonError::into_inner);
        Self {
            timeline,
            local: Mutex::new(LocalState {
                running: true,
                origin,
                accumulated: 0,
                offset,
            }),
        }
    }

    /// Creates an independent clock on the same timeline, reading `offset` now.
    pub fn fork(&self, offset: Timestamp) -> Self {
        Self::on_timeline(Arc::clone(&self.timeline), offset)
    }

    /// Advances the shared timeline by `ms` milliseconds.
    pub fn advance(&self, ms: i64) {
        let mut time = self.timeline.lock().unwrap_or_else(PoisonError::into_inner);
        *time += ms;
    }

    /// Returns the shared timeline value in milliseconds.
    pub fn timeline_ms(&self) -> i64 {
        *self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_local(&self) -> MutexGuard<'_, LocalState> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        let local = self.lock_local();
        let elapsed = if local.running {
            local.accumulated + (self.timeline_ms() - local.origin)
        } else {
            local.accumulated
        };
        (elapsed as Timestamp).wrapping_add(local.offset)
    }

    fn start(&self) {
        let mut local = self.lock_local();
        if !local.running {
            local.origin = self.timeline_ms();
            local.running = true;
        }
    }

    fn stop(&self) {
        let mut local = self.lock_local();
        if local.running {
            local.accumulated += self.timeline_ms() - local.origin;
            local.running = false;
        }
    }

    fn restart(&self, offset: Timestamp) {
        let mut local = self.lock_local();
        local.origin = self.timeline_ms();
        local.accumulated = 0;
        local.running = true;
        local.offset = offset;
    }

    fn is_running(&self) -> bool {
        self.lock_local().running
    }
}
