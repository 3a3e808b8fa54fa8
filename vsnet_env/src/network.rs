//! Datagram transport abstraction for vsnet nodes.

use crate::error::EnvError;
use crate::types::Datagram;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

/// Callback invoked on the receiving thread for every inbound datagram.
pub type ReceiveCallback = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

/// Best-effort datagram transport between vsnet nodes.
///
/// # Implementations
///
/// - **Production**: [`UdpTransport`](crate::UdpTransport) - one sender and one receiver OS thread
/// - **Testing/Simulation**: [`MemoryTransport`](crate::MemoryTransport) - in-process router
///
/// # Packet Flow
///
/// ```text
/// Node A                      Network                     Node B
///   |                            |                           |
///   |-- send(B, bytes) -> queue  |                           |
///   |      [tx thread] --------->|                           |
///   |                            |--------> [rx thread]      |
///   |                            |          callback(A, bytes) or inbound queue
/// ```
///
/// No retry, no ordering, no fragmentation: a payload must fit one datagram.
pub trait Transport: Send + Sync + 'static {
    /// Enqueues `payload` for asynchronous delivery to `target`.
    ///
    /// # Returns
    /// * `Ok(())` - queued (delivery is still not guaranteed)
    /// * `Err(EnvError::QueueFull)` - the outgoing queue is at capacity
    /// * `Err(EnvError::PayloadTooLarge)` - the payload does not fit a datagram
    ///
    /// Never blocks the caller.
    fn send(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError>;

    /// Returns the endpoint this transport is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Registers the callback that receives every inbound datagram.
    ///
    /// Until a callback is registered, datagrams accumulate in the inbound
    /// queue and are read with [`Transport::try_recv`].
    fn set_receiver(&self, callback: ReceiveCallback);

    /// Removes the registered callback; later datagrams go to the inbound queue.
    fn clear_receiver(&self);

    /// Pops one datagram from the inbound queue (only used without a callback).
    fn try_recv(&self) -> Option<Datagram>;

    /// Number of successful `send` calls so far.
    fn sent_count(&self) -> u64;

    /// Stops both directions. Later sends fail with `EnvError::Closed`.
    fn shutdown(&self);
}

/// Fault model consulted by the in-memory network for every datagram.
///
/// Implemented by the simulator to inject latency, jitter, loss and partitions.
pub trait LinkConditions: Send + Sync {
    /// Returns the delivery delay in milliseconds, or `None` to drop the datagram.
    fn route(&self, from: SocketAddr, to: SocketAddr) -> Option<i64>;
}

/// Receiving side shared by the transports: either a callback or a queue.
pub(crate) struct Inbox {
    callback: RwLock<Option<ReceiveCallback>>,
    queue_tx: Sender<Datagram>,
    queue_rx: Receiver<Datagram>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            callback: RwLock::new(None),
            queue_tx,
            queue_rx,
        }
    }

    pub(crate) fn set_callback(&self, callback: Option<ReceiveCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    /// Hands one datagram to the callback, or queues it.
    pub(crate) fn deliver(&self, origin: SocketAddr, payload: &[u8]) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(origin, payload),
            None => {
                // Receiver half lives in self, so the queue cannot be disconnected.
                let _ = self.queue_tx.send(Datagram::new(origin, payload.to_vec()));
            }
        }
    }

    pub(crate) fn try_recv(&self) -> Option<Datagram> {
        self.queue_rx.try_recv().ok()
    }
}
