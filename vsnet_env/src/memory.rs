//! In-process datagram router for tests and simulation.
//!
//! `send` only enqueues. Nothing moves until the owner calls
//! [`MemoryNetwork::deliver_due`] with the current virtual time, so a run is
//! fully determined by the order of sends and the [`LinkConditions`] in use.

use crate::error::EnvError;
use crate::network::{Inbox, LinkConditions, ReceiveCallback, Transport};
use crate::types::{is_broadcast, Datagram};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, trace, warn};

/// Upper bound on deliveries per `deliver_due` call (guards reply storms at zero latency).
const MAX_DELIVERIES_PER_CALL: usize = 100_000;

struct InFlight {
    deliver_at: i64,
    seq: u64,
    origin: SocketAddr,
    target: SocketAddr,
    payload: Vec<u8>,
}

impl InFlight {
    fn key(&self) -> (i64, u64) {
        (self.deliver_at, self.seq)
    }
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct RouterState {
    endpoints: HashMap<SocketAddr, Arc<Inbox>>,
    in_flight: BinaryHeap<Reverse<InFlight>>,
    next_seq: u64,
    now: i64,
    delivered: u64,
    dropped: u64,
}

/// Shared router connecting every [`MemoryTransport`] attached to it.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<RouterState>,
    conditions: RwLock<Option<Arc<dyn LinkConditions>>>,
}

impl MemoryNetwork {
    /// Creates an empty network with perfect links.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Installs the fault model consulted for every datagram.
    pub fn set_conditions(&self, conditions: Arc<dyn LinkConditions>) {
        *self.conditions.write().unwrap_or_else(PoisonError::into_inner) = Some(conditions);
    }

    /// Attaches a new endpoint at `addr`.
    ///
    /// # Errors
    /// `EnvError::Bind` if another endpoint already holds `addr`.
    pub fn attach(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<MemoryTransport>, EnvError> {
        let inbox = Arc::new(Inbox::new());
        {
            let mut state = self.lock();
            if state.endpoints.contains_key(&addr) {
                return Err(EnvError::bind(addr, ErrorKind::AddrInUse.into()));
            }
            state.endpoints.insert(addr, Arc::clone(&inbox));
        }
        debug!(%addr, "memory endpoint attached");
        Ok(Arc::new(MemoryTransport {
            network: Arc::clone(self),
            addr,
            inbox,
            sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    /// Delivers every datagram due at or before `now` (virtual milliseconds).
    ///
    /// Datagrams sent by receive callbacks during this call are delivered in
    /// the same call when they are already due. Returns the number delivered.
    pub fn deliver_due(&self, now: i64) -> usize {
        self.lock().now = now;
        self.deliver_until(Some(now))
    }

    /// Delivers everything in flight regardless of its due time.
    pub fn deliver_all(&self) -> usize {
        self.deliver_until(None)
    }

    fn deliver_until(&self, limit: Option<i64>) -> usize {
        let mut delivered = 0;
        while delivered < MAX_DELIVERIES_PER_CALL {
            let (packet, inbox) = {
                let mut state = self.lock();
                let due = match state.in_flight.peek() {
                    Some(Reverse(next)) => limit.map_or(true, |limit| next.deliver_at <= limit),
                    None => false,
                };
                if !due {
                    break;
                }
                let Some(Reverse(packet)) = state.in_flight.pop() else {
                    break;
                };
                let inbox = state.endpoints.get(&packet.target).cloned();
                (packet, inbox)
            };

            // Callbacks run outside the router lock so they can send replies.
            match inbox {
                Some(inbox) => {
                    inbox.deliver(packet.origin, &packet.payload);
                    self.lock().delivered += 1;
                    delivered += 1;
                }
                None => {
                    trace!(target = %packet.target, "endpoint detached before delivery");
                    self.lock().dropped += 1;
                }
            }
        }
        if delivered == MAX_DELIVERIES_PER_CALL {
            warn!(limit = MAX_DELIVERIES_PER_CALL, "delivery cap reached, remaining datagrams deferred");
        }
        delivered
    }

    /// Number of datagrams waiting for delivery.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total datagrams handed to a receiver.
    pub fn delivered_count(&self) -> u64 {
        self.lock().delivered
    }

    /// Total datagrams dropped by link conditions or detached endpoints.
    pub fn dropped_count(&self) -> u64 {
        self.lock().dropped
    }

    /// Addresses of all attached endpoints.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.lock().endpoints.keys().copied().collect();
        addrs.sort();
        addrs
    }

    fn route(&self, from: SocketAddr, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        let conditions = self
            .conditions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut state = self.lock();
        let targets: Vec<SocketAddr> = if is_broadcast(&target) {
            let mut targets: Vec<_> = state
                .endpoints
                .keys()
                .filter(|addr| addr.port() == target.port() && **addr != from)
                .copied()
                .collect();
            // HashMap order is random; keep delivery order reproducible.
            targets.sort();
            targets
        } else if state.endpoints.contains_key(&target) {
            vec![target]
        } else {
            return Err(EnvError::Unreachable(target));
        };

        for to in targets {
            let delay = match &conditions {
                Some(conditions) => conditions.route(from, to),
                None => Some(0),
            };
            let Some(delay) = delay else {
                trace!(%from, %to, "datagram dropped by link conditions");
                state.dropped += 1;
                continue;
            };
            let seq = state.next_seq;
            state.next_seq += 1;
            let deliver_at = state.now + delay.max(0);
            state.in_flight.push(Reverse(InFlight {
                deliver_at,
                seq,
                origin: from,
                target: to,
                payload: payload.clone(),
            }));
        }
        Ok(())
    }

    fn detach(&self, addr: SocketAddr) {
        if self.lock().endpoints.remove(&addr).is_some() {
            debug!(%addr, "memory endpoint detached");
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    addr: SocketAddr,
    inbox: Arc<Inbox>,
    sent: AtomicU64,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Returns the network this endpoint is attached to.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn send(&self, target: SocketAddr, payload: Vec<u8>) -> Result<(), EnvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnvError::Closed);
        }
        self.network.route(self.addr, target, payload)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
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
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.detach(self.addr);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::broadcast_endpoint;

    fn addr(host: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, host], port))
    }

    struct FixedDelay(i64);

    impl LinkConditions for FixedDelay {
        fn route(&self, _from: SocketAddr, _to: SocketAddr) -> Option<i64> {
            Some(self.0)
        }
    }

    struct DropAll;

    impl LinkConditions for DropAll {
        fn route(&self, _from: SocketAddr, _to: SocketAddr) -> Option<i64> {
            None
        }
    }

    #[test]
    fn test_nothing_moves_until_delivery() {
        let net = MemoryNetwork::new();
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();

        a.send(b.local_addr(), vec![5]).unwrap();
        assert!(b.try_recv().is_none());
        assert_eq!(net.in_flight(), 1);

        assert_eq!(net.deliver_due(0), 1);
        let datagram = b.try_recv().unwrap();
        assert_eq!(datagram.origin, a.local_addr());
        assert_eq!(datagram.payload, vec![5]);
    }

    #[test]
    fn test_latency_defers_delivery() {
        let net = MemoryNetwork::new();
        net.set_conditions(Arc::new(FixedDelay(30)));
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();

        a.send(b.local_addr(), vec![1]).unwrap();
        assert_eq!(net.deliver_due(29), 0);
        assert_eq!(net.deliver_due(30), 1);
        assert!(b.try_recv().is_some());
    }

    #[test]
    fn test_broadcast_reaches_same_port_except_sender() {
        let net = MemoryNetwork::new();
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();
        let c = net.attach(addr(3, 7000)).unwrap();
        let other_layer = net.attach(addr(2, 7001)).unwrap();

        a.send(broadcast_endpoint(7000), vec![0]).unwrap();
        assert_eq!(net.deliver_all(), 2);
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_some());
        assert!(other_layer.try_recv().is_none());
        assert_eq!(a.sent_count(), 1);
    }

    #[test]
    fn test_reply_from_callback_delivered_same_call() {
        let net = MemoryNetwork::new();
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();

        let weak_b = Arc::downgrade(&b);
        b.set_receiver(Arc::new(move |origin, bytes: &[u8]| {
            if let Some(b) = weak_b.upgrade() {
                b.send(origin, bytes.iter().map(|x| x + 1).collect()).unwrap();
            }
        }));

        a.send(b.local_addr(), vec![1]).unwrap();
        assert_eq!(net.deliver_due(0), 2);
        assert_eq!(a.try_recv().unwrap().payload, vec![2]);
    }

    #[test]
    fn test_dropped_by_conditions() {
        let net = MemoryNetwork::new();
        net.set_conditions(Arc::new(DropAll));
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();

        a.send(b.local_addr(), vec![1]).unwrap();
        assert_eq!(net.deliver_all(), 0);
        assert_eq!(net.dropped_count(), 1);
    }

    #[test]
    fn test_unknown_target_and_address_reuse() {
        let net = MemoryNetwork::new();
        let a = net.attach(addr(1, 7000)).unwrap();

        assert!(matches!(
            a.send(addr(9, 7000), vec![1]),
            Err(EnvError::Unreachable(_))
        ));
        assert_eq!(a.sent_count(), 0);
        assert!(matches!(net.attach(addr(1, 7000)), Err(EnvError::Bind { .. })));

        drop(a);
        assert!(net.attach(addr(1, 7000)).is_ok());
    }

    #[test]
    fn test_same_time_delivery_keeps_send_order() {
        let net = MemoryNetwork::new();
        let a = net.attach(addr(1, 7000)).unwrap();
        let b = net.attach(addr(2, 7000)).unwrap();

        for i in 0..10u8 {
            a.send(b.local_addr(), vec![i]).unwrap();
        }
        net.deliver_all();
        let order: Vec<u8> = std::iter::from_fn(|| b.try_recv()).map(|d| d.payload[0]).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }
}
