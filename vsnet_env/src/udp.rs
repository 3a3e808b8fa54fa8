//! UDP implementation of [`Transport`] with one sender and one receiver thread.
//!
//! Responsibilities:
//! - Bind one socket shared by both threads, so the origin a peer observes
//!   is also the endpoint it can reply to.
//! - TX thread: pop `(target, bytes)` from the bounded outgoing queue and `send_to`.
//! - RX thread: block on `recv_from` (with a short read timeout so shutdown is
//!   noticed promptly) and hand each datagram to the inbox.

use crate::error::EnvError;
use crate::network::{Inbox, ReceiveCallback, Transport};
use crate::types::Datagram;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Configuration for a [`UdpTransport`].
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local endpoint to bind (use port 0 for an ephemeral port)
    pub bind_addr: SocketAddr,

    /// Capacity of the outgoing queue
    pub queue_capacity: usize,

    /// Largest payload accepted by `send` and read by the receive loop
    pub max_datagram_size: usize,

    /// How often blocked threads check for shutdown
    pub poll_interval: Duration,
}

impl UdpConfig {
    /// Creates a configuration bound to `bind_addr` with default limits.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            queue_capacity: 1024,
            max_datagram_size: 1500,
            poll_interval: Duration::from_millis(50),
        }
    }
}

struct Outgoing {
    target: SocketAddr,
    payload: Vec<u8>,
}

/// Best-effort UDP transport.
pub struct UdpTransport {
    local_addr: SocketAddr,
    config: UdpConfig,
    tx: Sender<Outgoing>,
    inbox: Arc<Inbox>,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    sent: AtomicU64,
}

impl UdpTransport {
    /// Binds the socket and starts both threads.
    ///
    /// # Errors
    /// `EnvError::Bind` if the socket cannot be bound; this is fatal for the
    /// protocol layer that owns the transport.
    pub fn bind(config: UdpConfig) -> Result<Arc<Self>, EnvError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .map_err(|e| EnvError::bind(config.bind_addr, e))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(config.poll_interval))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);

        let (tx, rx) = bounded(config.queue_capacity);
        let inbox = Arc::new(Inbox::new());
        let running = Arc::new(AtomicBool::new(true));

        let rx_handle = {
            let socket = Arc::clone(&socket);
            let inbox = Arc::clone(&inbox);
            let running = Arc::clone(&running);
            let buf_len = config.max_datagram_size;
            thread::Builder::new()
                .name(format!("vsnet-rx-{}", local_addr.port()))
                .spawn(move || receiver_loop(&socket, &inbox, &running, buf_len))?
        };

        let tx_handle = {
            let running = Arc::clone(&running);
            let poll = config.poll_interval;
            thread::Builder::new()
                .name(format!("vsnet-tx-{}", local_addr.port()))
                .spawn(move || sender_loop(&socket, &rx, &running, poll))?
        };

        info!(addr = %local_addr, "UDP transport bound");

        Ok(Arc::new(Self {
            local_addr,
            config,
            tx,
            inbox,
            running,
            threads: Mutex::new(vec![rx_handle, tx_handle]),
            sent: AtomicU64::new(0),
        }))
    }

    /// Number of datagrams waiting in the outgoing queue.
    pub fn pending(&self) -> usize {
        self.tx.len()
    }
}

fn receiver_loop(socket: &UdpSocket, inbox: &Inbox, running: &AtomicBool, buf_len: usize) {
    let mut buf = vec![0u8; buf_len];
    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, origin)) => {
                trace!(%origin, len, "datagram received");
                inbox.deliver(origin, &buf[..len]);
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            // ICMP port-unreachable surfaces here on some platforms; not fatal.
            Err(e) => debug!(error = %e, "recv_from failed"),
        }
    }
    trace!("receiver loop exited");
}

fn sender_loop(
    socket: &UdpSocket,
    queue: &Receiver<Outgoing>,
    running: &AtomicBool,
    poll: Duration,
) {
    while running.load(Ordering::Acquire) {
        match queue.recv_timeout(poll) {
            Ok(out) => {
                if let Err(e) = socket.send_to(&out.payload, out.target) {
                    debug!(target = %out.target, error = %e, "send_to failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("sender loop exited");
}

impl Transport for UdpTransport {
    fn send(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(EnvError::Closed);
        }
        if payload.len() > self.config.max_datagram_size {
            return Err(EnvError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_datagram_size,
            });
        }
        match self.tx.try_send(Outgoing { target, payload }) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(EnvError::QueueFull(self.config.queue_capacity)),
            Err(TrySendError::Disconnected(_)) => Err(EnvError::Closed),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn set_receiver(&self, callback: ReceiveCallback) {
        self.inbox.set_callback(Some(callback));
    }

    fn clear_receiver(&self) {
        self.inbox.set_callback(None);
    }

    fn try_recv(&self) -> Option<Datagram> {
        self.inbox.try_recv()
    }

    fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let current = thread::current().id();
        for handle in handles {
            // A receive callback may shut its own transport down.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(addr = %self.local_addr, "transport thread panicked");
            }
        }
        info!(addr = %self.local_addr, "UDP transport shut down");
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
