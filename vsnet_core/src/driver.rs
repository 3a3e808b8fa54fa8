//! Session driver: runs the tick loop and registry cycles on a dedicated thread.

use crate::error::SessionError;
use crate::session::ScenarioSession;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vsnet_env::EnvError;

/// Periods of the driver loop.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Period of `ScenarioSession::tick` (default: 20 ms)
    pub tick_period: Duration,

    /// Period of discovery scans (default: 1 s)
    pub scan_period: Duration,

    /// Period of clock synchronization rounds (default: 2 s)
    pub sync_period: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(20),
            scan_period: Duration::from_secs(1),
            sync_period: Duration::from_secs(2),
        }
    }
}

/// Owns the tick thread of one session.
///
/// Dropping the driver stops and joins the thread.
pub struct SessionDriver {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl SessionDriver {
    /// Starts ticking `session` immediately. The first scan and sync round run
    /// on the first iteration.
    pub fn spawn(session: Arc<ScenarioSession>, config: DriverConfig) -> Result<Self, SessionError> {
        let (stop, stopped) = bounded::<()>(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let handle = thread::Builder::new()
            .name(format!("vsnet-tick-{}", session.local_addr().port()))
            .spawn(move || {
                info!(tick_ms = config.tick_period.as_millis() as u64, "tick thread started");
                let mut last_scan: Option<Instant> = None;
                let mut last_sync: Option<Instant> = None;
                loop {
                    let started = Instant::now();
                    if last_scan.map_or(true, |at| at.elapsed() >= config.scan_period) {
                        session.registry().scan();
                        last_scan = Some(started);
                    }
                    if last_sync.map_or(true, |at| at.elapsed() >= config.sync_period) {
                        session.registry().synchronize_devices();
                        last_sync = Some(started);
                    }
                    session.tick();
                    counter.fetch_add(1, Ordering::Relaxed);

                    let spent = started.elapsed();
                    if spent > config.tick_period {
                        debug!(spent_ms = spent.as_millis() as u64, "tick overran its period");
                    }
                    match stopped.recv_timeout(config.tick_period.saturating_sub(spent)) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("tick thread exiting");
            })
            .map_err(|e| SessionError::Transport(EnvError::Io(e)))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
            ticks,
        })
    }

    /// Ticks completed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn shutdown(&mut self) {
        // Dropping the sender disconnects the loop's wait.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("tick thread panicked");
            }
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
