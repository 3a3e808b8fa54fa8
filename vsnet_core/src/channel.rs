//! Numbered pub/sub channel carrying one element type.
//!
//! Each tick a channel runs two phases:
//! - **Host push**: every host element that has something to send is wrapped
//!   in a [`Header`] and sent to every subscriber, and handed to every
//!   multicast target channel.
//! - **Remote pull**: queued updates are parsed; unknown ids become new
//!   replicas, known ids are buffered, then the [`QosManager`] releases
//!   buffered updates.

use crate::element::{ElementHandle, ElementIdGenerator, ElementInfo, Replica, ScenarioElement, UpdateCallback};
use crate::error::SessionError;
use crate::qos::QosManager;
use crate::session::{build_session_package, SessionCommand};
use crate::wire::Header;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};
use vsnet_env::{Clock, EnvError, Timestamp, Transport};

/// Invoked on the tick thread when an update creates a new replica.
pub type NewRemoteCallback<T> = Box<dyn Fn(&ElementHandle<T>) + Send + Sync>;

/// Invoked with `(element, timestamp, applied_at)` for every buffered update
/// applied on any replica of a channel.
pub type UpdateObserver = Arc<dyn Fn(ElementInfo, Timestamp, Timestamp) + Send + Sync>;

/// Type-erased view of a [`Channel`] used by the session's channel table and
/// by multicast fan-out.
pub trait ChannelHandle: Send + Sync + 'static {
    fn id(&self) -> u8;

    /// Host push phase of a tick.
    fn push_host_updates(&self);

    /// Remote pull phase of a tick.
    fn pull_remote_updates(&self);

    /// Queues an update received from the network and forwards it to the
    /// multicast targets.
    fn enqueue_network(&self, origin: SocketAddr, bytes: &[u8]);

    /// Queues an update handed over by another channel. Never forwarded again.
    fn enqueue_multicast(&self, origin: SocketAddr, bytes: Vec<u8>);

    fn subscribe_device(&self, addr: SocketAddr);

    fn unsubscribe_device(&self, addr: SocketAddr);

    fn unsubscribe_all(&self);

    /// Drops every replica owned by `origin`. Returns how many were removed.
    fn destroy_remote_elements(&self, origin: SocketAddr) -> usize;

    /// Stops all processing; later enqueues and ticks are no-ops.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

struct Inbound {
    origin: SocketAddr,
    bytes: Vec<u8>,
}

/// Typed channel of elements of kind `T`.
pub struct Channel<T: ScenarioElement> {
    id: u8,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    ids: Arc<ElementIdGenerator>,
    host: Mutex<Vec<ElementHandle<T>>>,
    remote: Mutex<BTreeMap<u64, Replica<T>>>,
    subscribers: Mutex<Vec<SocketAddr>>,
    multicast: Mutex<Vec<Arc<dyn ChannelHandle>>>,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    qos: Mutex<Arc<QosManager>>,
    observer: Mutex<Option<UpdateObserver>>,
    on_new_remote: Option<NewRemoteCallback<T>>,
    closed: AtomicBool,
}

impl<T: ScenarioElement> Channel<T> {
    pub(crate) fn new(
        id: u8,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        ids: Arc<ElementIdGenerator>,
        on_new_remote: Option<NewRemoteCallback<T>>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let qos = Arc::new(QosManager::new(Arc::clone(&clock)));
        Self {
            id,
            transport,
            clock,
            ids,
            host: Mutex::new(Vec::new()),
            remote: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            multicast: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx,
            qos: Mutex::new(qos),
            observer: Mutex::new(None),
            on_new_remote,
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a host element in its default state.
    pub fn add_host_element(&self, prefab: u8) -> Result<ElementHandle<T>, SessionError> {
        self.add_host_element_with(prefab, T::default())
    }

    /// Creates a host element with an initial state.
    pub fn add_host_element_with(&self, prefab: u8, state: T) -> Result<ElementHandle<T>, SessionError> {
        let info = ElementInfo {
            id: self.ids.next_id()?,
            prefab,
            origin: self.transport.local_addr(),
            is_host: true,
        };
        let handle = ElementHandle::new(info, Arc::new(Mutex::new(state)));
        lock(&self.host).push(handle.clone());
        debug!(channel = self.id, id = info.id, prefab, "host element created");
        Ok(handle)
    }

    /// Stops publishing a host element. Returns false if the id is unknown.
    pub fn destroy_host_element(&self, id: u64) -> bool {
        let mut host = lock(&self.host);
        let before = host.len();
        host.retain(|handle| handle.id() != id);
        before != host.len()
    }

    pub fn host_elements(&self) -> Vec<ElementHandle<T>> {
        lock(&self.host).clone()
    }

    pub fn remote_elements(&self) -> Vec<ElementHandle<T>> {
        lock(&self.remote).values().map(Replica::handle).collect()
    }

    pub fn remote_element(&self, id: u64) -> Option<ElementHandle<T>> {
        lock(&self.remote).get(&id).map(Replica::handle)
    }

    /// Host and remote elements matching `predicate`.
    pub fn find_elements(&self, predicate: impl Fn(&ElementInfo, &T) -> bool) -> Vec<ElementHandle<T>> {
        self.host_elements()
            .into_iter()
            .chain(self.remote_elements())
            .filter(|handle| predicate(&handle.info(), &handle.lock()))
            .collect()
    }

    /// Updates buffered for replica `id` and not yet applied.
    pub fn pending_updates(&self, id: u64) -> Option<usize> {
        lock(&self.remote).get(&id).map(|replica| replica.pending().len())
    }

    /// Updates applied to replica `id`, including the one that created it.
    pub fn applied_updates(&self, id: u64) -> Option<u64> {
        lock(&self.remote).get(&id).map(Replica::applied_count)
    }

    /// Asks the session at `addr` to publish this channel to us.
    pub fn subscribe_to(&self, addr: SocketAddr) -> Result<(), EnvError> {
        self.transport
            .send(addr, build_session_package(SessionCommand::Subscribe, self.id, &[]))
    }

    pub fn unsubscribe_from(&self, addr: SocketAddr) -> Result<(), EnvError> {
        self.transport
            .send(addr, build_session_package(SessionCommand::Unsubscribe, self.id, &[]))
    }

    pub fn subscribers(&self) -> Vec<SocketAddr> {
        lock(&self.subscribers).clone()
    }

    /// Also hands every host update, and every network update received, to `target`.
    pub fn add_multicast_target(&self, target: Arc<dyn ChannelHandle>) {
        let mut targets = lock(&self.multicast);
        if !targets.iter().any(|t| Arc::ptr_eq(t, &target)) {
            targets.push(target);
        }
    }

    pub fn remove_multicast_target(&self, target: &Arc<dyn ChannelHandle>) {
        lock(&self.multicast).retain(|t| !Arc::ptr_eq(t, target));
    }

    pub fn qos_manager(&self) -> Arc<QosManager> {
        Arc::clone(&lock(&self.qos))
    }

    /// Replaces the channel's QoS manager, possibly with one shared with other channels.
    pub fn set_qos_manager(&self, manager: Arc<QosManager>) {
        *lock(&self.qos) = manager;
    }

    /// Installs a callback on one replica. Returns false if the id is unknown.
    pub fn set_update_callback(&self, id: u64, callback: Option<UpdateCallback>) -> bool {
        match lock(&self.remote).get_mut(&id) {
            Some(replica) => {
                replica.set_update_callback(callback);
                true
            }
            None => false,
        }
    }

    /// Installs `observer` on every current and future replica of this channel.
    pub fn set_update_observer(&self, observer: UpdateObserver) {
        for replica in lock(&self.remote).values_mut() {
            replica.set_update_callback(Some(observed(replica.info(), &observer)));
        }
        *lock(&self.observer) = Some(observer);
    }

    fn ingest(&self, inbound: Inbound, host_ids: &HashSet<u64>, created: &mut Vec<ElementHandle<T>>) {
        let (header, payload) = match Header::split(&inbound.bytes) {
            Ok(split) => split,
            Err(e) => {
                debug!(channel = self.id, origin = %inbound.origin, error = %e, "malformed update dropped");
                return;
            }
        };
        if host_ids.contains(&header.id) {
            trace!(channel = self.id, id = header.id, "update for own host element dropped");
            return;
        }

        let mut remote = lock(&self.remote);
        if let Some(replica) = remote.get_mut(&header.id) {
            if !replica.pending_mut().push(header.timestamp, payload.to_vec()) {
                debug!(channel = self.id, id = header.id, ts = header.timestamp, "duplicate update dropped");
            }
            return;
        }

        match Replica::<T>::from_update(header, inbound.origin, payload) {
            Ok(mut replica) => {
                if let Some(observer) = lock(&self.observer).as_ref() {
                    replica.set_update_callback(Some(observed(replica.info(), observer)));
                }
                info!(channel = self.id, id = header.id, origin = %inbound.origin, "remote element created");
                created.push(replica.handle());
                remote.insert(header.id, replica);
            }
            Err(e) => debug!(channel = self.id, id = header.id, error = %e, "undersized first update dropped"),
        }
    }
}

fn observed(info: ElementInfo, observer: &UpdateObserver) -> UpdateCallback {
    let observer = Arc::clone(observer);
    Arc::new(move |timestamp, applied_at| observer(info, timestamp, applied_at))
}

impl<T: ScenarioElement> ChannelHandle for Channel<T> {
    fn id(&self) -> u8 {
        self.id
    }

    fn push_host_updates(&self) {
        if self.is_closed() {
            return;
        }
        let subscribers = self.subscribers();
        let targets = lock(&self.multicast).clone();
        if subscribers.is_empty() && targets.is_empty() {
            return;
        }

        let now = self.clock.now();
        let updates: Vec<Vec<u8>> = lock(&self.host)
            .iter()
            .filter_map(|handle| {
                let payload = handle.lock().produce_update_if_changed()?;
                let header = Header {
                    id: handle.id(),
                    prefab: handle.prefab(),
                    timestamp: now,
                };
                Some(header.wrap(&payload))
            })
            .collect();

        let local = self.transport.local_addr();
        for update in updates {
            let package = build_session_package(SessionCommand::ElementUpdate, self.id, &update);
            for subscriber in &subscribers {
                if let Err(e) = self.transport.send(*subscriber, package.clone()) {
                    debug!(channel = self.id, %subscriber, error = %e, "update send failed");
                }
            }
            for target in &targets {
                target.enqueue_multicast(local, update.clone());
            }
        }
    }

    fn pull_remote_updates(&self) {
        if self.is_closed() {
            return;
        }
        let host_ids: HashSet<u64> = lock(&self.host).iter().map(ElementHandle::id).collect();
        let mut created = Vec::new();
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            self.ingest(inbound, &host_ids, &mut created);
        }
        if let Some(callback) = &self.on_new_remote {
            for handle in &created {
                callback(handle);
            }
        }

        let qos = self.qos_manager();
        for replica in lock(&self.remote).values_mut() {
            replica.drain(&qos);
        }
    }

    fn enqueue_network(&self, origin: SocketAddr, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        let targets = lock(&self.multicast).clone();
        for target in targets {
            target.enqueue_multicast(origin, bytes.to_vec());
        }
        self.enqueue_multicast(origin, bytes.to_vec());
    }

    fn enqueue_multicast(&self, origin: SocketAddr, bytes: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        // Receiver half lives in self, so the queue cannot be disconnected.
        let _ = self.inbound_tx.send(Inbound { origin, bytes });
    }

    fn subscribe_device(&self, addr: SocketAddr) {
        let mut subscribers = lock(&self.subscribers);
        if !subscribers.contains(&addr) {
            subscribers.push(addr);
            info!(channel = self.id, %addr, "subscriber added");
        }
    }

    fn unsubscribe_device(&self, addr: SocketAddr) {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|s| *s != addr);
        if subscribers.len() != before {
            info!(channel = self.id, %addr, "subscriber removed");
        }
    }

    fn unsubscribe_all(&self) {
        lock(&self.subscribers).clear();
    }

    fn destroy_remote_elements(&self, origin: SocketAddr) -> usize {
        let mut remote = lock(&self.remote);
        let before = remote.len();
        remote.retain(|_, replica| replica.info().origin != origin);
        before - remote.len()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        while self.inbound_rx.try_recv().is_ok() {}
        lock(&self.host).clear();
        lock(&self.remote).clear();
        lock(&self.subscribers).clear();
        lock(&self.multicast).clear();
        info!(channel = self.id, "channel closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
