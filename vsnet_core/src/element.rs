//! Replicated scenario elements: identity, state and the pending update buffer.

use crate::error::{SessionError, WireError};
use crate::qos::QosManager;
use crate::wire::Header;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use vsnet_env::{is_due, Timestamp};

/// State of one replicated object, as seen by the replication layer.
///
/// `apply` must accept any payload of the expected length and be idempotent;
/// `produce_update_if_changed` decides when a host copy is worth sending.
pub trait ScenarioElement: Default + Send + 'static {
    /// Overwrites the state from an update payload (header already stripped).
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError>;

    /// Returns the encoded state if it should be sent this tick.
    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>>;
}

/// Identity of a replicated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementInfo {
    pub id: u64,
    pub prefab: u8,
    /// Endpoint of the session that owns the authoritative copy
    pub origin: SocketAddr,
    pub is_host: bool,
}

/// Shared handle to an element's state, held by the channel and its collaborator.
pub struct ElementHandle<T> {
    info: ElementInfo,
    state: Arc<Mutex<T>>,
}

impl<T> Clone for ElementHandle<T> {
    fn clone(&self) -> Self {
        Self {
            info: self.info,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> ElementHandle<T> {
    pub(crate) fn new(info: ElementInfo, state: Arc<Mutex<T>>) -> Self {
        Self { info, state }
    }

    pub fn info(&self) -> ElementInfo {
        self.info
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn prefab(&self) -> u8 {
        self.info.prefab
    }

    pub fn is_host(&self) -> bool {
        self.info.is_host
    }

    /// Locks the state for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with the state locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }
}

impl<T: Clone> ElementHandle<T> {
    pub fn snapshot(&self) -> T {
        self.lock().clone()
    }
}

/// Time-ordered updates waiting to be applied to one replica.
///
/// `incoming` holds updates keyed by their sender timestamp. `degraded` is the
/// buffer used by recorded-trace replay, keyed by the delayed timestamp and
/// still carrying the sender timestamp.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    pub(crate) incoming: BTreeMap<Timestamp, Vec<u8>>,
    pub(crate) degraded: BTreeMap<Timestamp, (Timestamp, Vec<u8>)>,
}

impl PendingBuffer {
    /// Inserts an update. Returns false (and keeps the first copy) on a duplicate timestamp.
    pub fn push(&mut self, timestamp: Timestamp, payload: Vec<u8>) -> bool {
        if self.incoming.contains_key(&timestamp) {
            return false;
        }
        self.incoming.insert(timestamp, payload);
        true
    }

    /// Entries in both buffers.
    pub fn len(&self) -> usize {
        self.incoming.len() + self.degraded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.incoming.is_empty() && self.degraded.is_empty()
    }

    pub fn earliest(&self) -> Option<Timestamp> {
        self.incoming.keys().next().copied()
    }

    /// Number of incoming entries stamped at or before `now`.
    pub fn ready_count(&self, now: Timestamp) -> usize {
        self.incoming.keys().filter(|ts| is_due(**ts, now)).count()
    }

    pub(crate) fn pop_incoming(&mut self) -> Option<(Timestamp, Vec<u8>)> {
        self.incoming.pop_first()
    }

    pub fn clear(&mut self) {
        self.incoming.clear();
        self.degraded.clear();
    }
}

/// Called with `(timestamp, applied_at)` whenever a buffered update is applied.
pub type UpdateCallback = Arc<dyn Fn(Timestamp, Timestamp) + Send + Sync>;

/// Local copy of an element owned by another session.
pub struct Replica<T> {
    info: ElementInfo,
    state: Arc<Mutex<T>>,
    pending: PendingBuffer,
    on_update: Option<UpdateCallback>,
    applied: u64,
}

impl<T: ScenarioElement> Replica<T> {
    /// Instantiates a replica from its first update.
    pub(crate) fn from_update(header: Header, origin: SocketAddr, payload: &[u8]) -> Result<Self, WireError> {
        let mut state = T::default();
        state.apply(payload)?;
        Ok(Self {
            info: ElementInfo {
                id: header.id,
                prefab: header.prefab,
                origin,
                is_host: false,
            },
            state: Arc::new(Mutex::new(state)),
            pending: PendingBuffer::default(),
            on_update: None,
            applied: 1,
        })
    }

    pub fn info(&self) -> ElementInfo {
        self.info
    }

    pub fn handle(&self) -> ElementHandle<T> {
        ElementHandle::new(self.info, Arc::clone(&self.state))
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }

    pub(crate) fn pending_mut(&mut self) -> &mut PendingBuffer {
        &mut self.pending
    }

    /// Number of updates applied so far, including the one that created the replica.
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    pub fn set_update_callback(&mut self, callback: Option<UpdateCallback>) {
        self.on_update = callback;
    }

    /// Applies whatever the QoS strategy releases this tick.
    pub(crate) fn drain(&mut self, qos: &QosManager) -> usize {
        let now = qos.now();
        let Self {
            info,
            state,
            pending,
            on_update,
            applied,
        } = self;
        qos.drain(pending, &mut |timestamp, payload| {
            let result = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(&payload);
            match result {
                Ok(()) => {
                    *applied += 1;
                    if let Some(callback) = on_update.as_deref() {
                        callback(timestamp, now);
                    }
                }
                Err(e) => debug!(id = info.id, timestamp, error = %e, "update rejected by element"),
            }
        })
    }
}

/// Generates element ids unique per host endpoint.
///
/// Layout: `ip (32 bits) | port (16 bits) | counter (16 bits)`. IPv6
/// addresses are folded to 32 bits by XOR of their four words.
#[derive(Debug)]
pub struct ElementIdGenerator {
    base: u64,
    next: AtomicU32,
}

impl ElementIdGenerator {
    pub fn new(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => u32::from(ip),
            IpAddr::V6(ip) => {
                let bits = u128::from(ip);
                (0..4).fold(0u32, |acc, word| acc ^ (bits >> (word * 32)) as u32)
            }
        };
        Self {
            base: (u64::from(ip) << 32) | (u64::from(addr.port()) << 16),
            next: AtomicU32::new(0),
        }
    }

    /// Returns a fresh id.
    ///
    /// # Errors
    /// `SessionError::IdSpaceExhausted` after 65536 ids.
    pub fn next_id(&self) -> Result<u64, SessionError> {
        let counter = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n <= u32::from(u16::MAX)).then_some(n + 1)
            })
            .map_err(|_| SessionError::IdSpaceExhausted)?;
        Ok(self.base | u64::from(counter))
    }

    /// Returns true if `id` was (or could be) produced by this generator.
    pub fn owns(&self, id: u64) -> bool {
        id & !0xFFFF == self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct Counter {
        value: u8,
    }

    impl ScenarioElement for Counter {
        fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
            self.value = *payload.first().ok_or(WireError::Undersized { needed: 1, got: 0 })?;
            Ok(())
        }

        fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
            Some(vec![self.value])
        }
    }

    fn origin() -> SocketAddr {
        "10.0.0.2:7001".parse().unwrap()
    }

    #[test]
    fn test_duplicate_timestamp_keeps_first() {
        let mut buffer = PendingBuffer::default();
        assert!(buffer.push(100, vec![1]));
        assert!(!buffer.push(100, vec![2]));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.pop_incoming(), Some((100, vec![1])));
    }

    #[test]
    fn test_ready_count() {
        let mut buffer = PendingBuffer::default();
        for ts in [100, 120, 115, 200] {
            buffer.push(ts, vec![]);
        }
        assert_eq!(buffer.ready_count(130), 3);
        assert_eq!(buffer.earliest(), Some(100));
    }

    #[test]
    fn test_replica_from_update_applies_payload() {
        let header = Header { id: 9, prefab: 1, timestamp: 0 };
        let replica = Replica::<Counter>::from_update(header, origin(), &[42]).unwrap();
        assert_eq!(replica.handle().lock().value, 42);
        assert!(!replica.info().is_host);
        assert_eq!(replica.applied_count(), 1);

        assert!(Replica::<Counter>::from_update(header, origin(), &[]).is_err());
    }

    #[test]
    fn test_id_layout() {
        let ids = ElementIdGenerator::new("192.168.1.20:7001".parse().unwrap());
        let id = ids.next_id().unwrap();
        assert_eq!(id >> 32, u64::from(u32::from(std::net::Ipv4Addr::new(192, 168, 1, 20))));
        assert_eq!((id >> 16) & 0xFFFF, 7001);
        assert_eq!(id & 0xFFFF, 0);
        assert_eq!(ids.next_id().unwrap() & 0xFFFF, 1);
        assert!(ids.owns(id));
        assert!(!ElementIdGenerator::new(origin()).owns(id));
    }

    #[test]
    fn test_id_space_exhaustion() {
        let ids = ElementIdGenerator::new(origin());
        for _ in 0..=u16::MAX {
            ids.next_id().unwrap();
        }
        assert!(matches!(ids.next_id(), Err(SessionError::IdSpaceExhausted)));
        assert!(matches!(ids.next_id(), Err(SessionError::IdSpaceExhausted)));
    }

    #[test]
    fn test_ipv6_ids_are_distinct_per_port() {
        let a = ElementIdGenerator::new("[fe80::1]:7001".parse().unwrap());
        let b = ElementIdGenerator::new("[fe80::1]:7002".parse().unwrap());
        assert_ne!(a.next_id().unwrap(), b.next_id().unwrap());
    }

    proptest! {
        #[test]
        fn prop_buffer_stores_one_entry_per_timestamp(stamps in prop::collection::vec(0i32..50, 0..100)) {
            let mut buffer = PendingBuffer::default();
            for ts in &stamps {
                buffer.push(*ts, vec![]);
            }
            let mut unique = stamps.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(buffer.len(), unique.len());
        }
    }
}
