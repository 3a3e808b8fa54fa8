//! Device discovery and peer-to-peer clock synchronization.
//!
//! Discovery is a broadcast `GetNodeData` answered with `NodeData`. Clock
//! synchronization is a two-phase handshake per device, with no central
//! time server:
//!
//! ```text
//! initiator                               device
//!   sent = now()
//!   |---- SyncClock(sent) ------------------->|  clock.restart(sent)
//!   |<--- AckSyncClock(sent) -----------------|
//!   received = now()
//!   accuracy = |received - sent|  (one round trip)
//!   accuracy <= 10 ms  => Synchronized
//!   otherwise          => Desynchronized, handshake sent again
//! ```

use crate::dispatch::{self, CommandDispatcher};
use crate::error::WireError;
use crate::wire::{decode_timestamp, encode_timestamp, NodeData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace, warn};
use vsnet_env::{broadcast_endpoint, elapsed_between, Clock, DeviceId, Timestamp, Transport};

/// Largest round trip (ms) accepted as a successful synchronization.
pub const MIN_CLOCK_ACCURACY: Timestamp = 10;

/// Time (ms) an unanswered handshake blocks a new attempt.
pub const SYNC_TIMEOUT: Timestamp = 80;

/// Commands understood by the registry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistryCommand {
    GetNodeData = 0,
    SyncClock = 1,
    NodeData = 2,
    AckSyncClock = 3,
}

impl TryFrom<u8> for RegistryCommand {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::GetNodeData),
            1 => Ok(Self::SyncClock),
            2 => Ok(Self::NodeData),
            3 => Ok(Self::AckSyncClock),
            other => Err(WireError::UnknownCommand(other)),
        }
    }
}

/// Synchronization state of our view of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Idle,
    Syncing,
    Synchronized,
    Desynchronized,
}

/// What a device can do, as reported in its node data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub haptics: bool,
    pub mocap: bool,
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub address: SocketAddr,
    pub capabilities: Capabilities,
    pub battery_level: u32,
    /// Last non-zero haptics channel reported
    pub haptics_channel: u8,
    pub last_seen: Timestamp,
    pub sync_state: SyncState,
    pub sync_sent: Timestamp,
    pub sync_received: Timestamp,
    /// Timestamp the device's clock was restarted to by our last good handshake
    pub synchronized_timestamp: Timestamp,
}

impl Device {
    fn discovered(address: SocketAddr, data: &NodeData, now: Timestamp) -> Self {
        let mut device = Self {
            id: DeviceId(data.device_id),
            address,
            capabilities: Capabilities::default(),
            battery_level: 0,
            haptics_channel: 0,
            last_seen: now,
            sync_state: SyncState::Idle,
            sync_sent: 0,
            sync_received: 0,
            synchronized_timestamp: 0,
        };
        device.update_metadata(data, now);
        device
    }

    /// Last write wins for everything except the synchronization timestamp.
    fn update_metadata(&mut self, data: &NodeData, now: Timestamp) {
        self.capabilities.haptics = data.haptics_channel != 0;
        if data.haptics_channel != 0 {
            self.haptics_channel = data.haptics_channel;
        }
        self.capabilities.mocap = data.mocap_available;
        self.battery_level = data.battery_level;
        self.last_seen = now;

        // Someone else restarted its clock since our handshake.
        if self.sync_state == SyncState::Synchronized
            && self.synchronized_timestamp != data.synchronized_timestamp
        {
            debug!(device = %self.id, "device clock restarted elsewhere, desynchronized");
            self.sync_state = SyncState::Desynchronized;
        }
    }

    /// Round trip measured by the last handshake, in milliseconds.
    pub fn accuracy(&self) -> Timestamp {
        elapsed_between(self.sync_sent, self.sync_received).wrapping_abs()
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync_state == SyncState::Synchronized
    }

    /// Returns true if the device answered within `window` ms of `now`.
    pub fn seen_within(&self, now: Timestamp, window: Timestamp) -> bool {
        elapsed_between(self.last_seen, now) < window
    }

    /// Records a new handshake, unless one is still pending within the timeout.
    fn start_sync(&mut self, now: Timestamp) -> Option<Timestamp> {
        if self.sync_state == SyncState::Syncing
            && elapsed_between(self.sync_sent, now) < SYNC_TIMEOUT
        {
            return None;
        }
        self.sync_state = SyncState::Syncing;
        self.sync_sent = now;
        Some(now)
    }

    fn end_sync(&mut self, acked: Timestamp, now: Timestamp) {
        self.sync_received = now;
        if self.accuracy() <= MIN_CLOCK_ACCURACY {
            self.sync_state = SyncState::Synchronized;
            self.synchronized_timestamp = acked;
        } else {
            self.sync_state = SyncState::Desynchronized;
        }
    }
}

/// Static description of the local device.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub device_id: u8,
    /// Non-zero if this device drives a haptic interface
    pub haptics_channel: u8,
    pub mocap_available: bool,
    pub battery_level: u32,
    /// Destinations of every discovery scan
    pub broadcast_targets: Vec<SocketAddr>,
}

impl RegistryConfig {
    /// Describes device `device_id` scanning the limited broadcast address on `port`.
    pub fn new(device_id: u8, port: u16) -> Self {
        Self {
            device_id,
            haptics_channel: 0,
            mocap_available: false,
            battery_level: 100,
            broadcast_targets: vec![broadcast_endpoint(port)],
        }
    }
}

/// Registry of discovered devices, bound to its own transport.
pub struct DeviceRegistry {
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    broadcast_targets: Vec<SocketAddr>,
    local: Mutex<NodeData>,
    devices: Mutex<BTreeMap<DeviceId, Device>>,
    scan_targets: Mutex<Vec<SocketAddr>>,
}

impl DeviceRegistry {
    /// Creates the registry and registers it as its transport's receiver.
    pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, config: RegistryConfig) -> Arc<Self> {
        let local = NodeData {
            device_id: config.device_id,
            haptics_channel: config.haptics_channel,
            mocap_available: config.mocap_available,
            battery_level: config.battery_level,
            synchronized_timestamp: Timestamp::MAX,
        };
        let registry = Arc::new(Self {
            transport,
            clock,
            broadcast_targets: config.broadcast_targets,
            local: Mutex::new(local),
            devices: Mutex::new(BTreeMap::new()),
            scan_targets: Mutex::new(Vec::new()),
        });
        dispatch::attach(&registry);
        info!(
            device = %DeviceId(config.device_id),
            addr = %registry.transport.local_addr(),
            "device registry started"
        );
        registry
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn local_id(&self) -> DeviceId {
        DeviceId(lock(&self.local).device_id)
    }

    /// Node data this device advertises.
    pub fn local_node_data(&self) -> NodeData {
        *lock(&self.local)
    }

    pub fn set_battery_level(&self, level: u32) {
        lock(&self.local).battery_level = level;
    }

    /// Adds a unicast address to every subsequent scan.
    pub fn add_scan_target(&self, addr: SocketAddr) {
        let mut targets = lock(&self.scan_targets);
        if !targets.contains(&addr) {
            targets.push(addr);
        }
    }

    pub fn remove_scan_target(&self, addr: SocketAddr) {
        lock(&self.scan_targets).retain(|target| *target != addr);
    }

    /// Sends `GetNodeData` to the broadcast targets and every extra scan target.
    pub fn scan(&self) {
        let extra = lock(&self.scan_targets).clone();
        trace!(targets = self.broadcast_targets.len() + extra.len(), "scanning");
        for target in self.broadcast_targets.iter().chain(extra.iter()) {
            self.send_or_log(*target, RegistryCommand::GetNodeData, &[]);
        }
    }

    /// Starts a handshake with every device that is not synchronized.
    pub fn synchronize_devices(&self) {
        let now = self.clock.now();
        let pending: Vec<(SocketAddr, Timestamp)> = lock(&self.devices)
            .values_mut()
            .filter(|device| !device.is_synchronized())
            .filter_map(|device| device.start_sync(now).map(|sent| (device.address, sent)))
            .collect();
        for (addr, sent) in pending {
            self.send_or_log(addr, RegistryCommand::SyncClock, &encode_timestamp(sent));
        }
    }

    /// All known devices, ordered by id.
    pub fn devices(&self) -> Vec<Device> {
        lock(&self.devices).values().cloned().collect()
    }

    /// Devices that answered a scan within the last `window` ms.
    pub fn available_devices(&self, window: Timestamp) -> Vec<Device> {
        let now = self.clock.now();
        lock(&self.devices)
            .values()
            .filter(|device| device.seen_within(now, window))
            .cloned()
            .collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        lock(&self.devices).get(&id).cloned()
    }

    pub fn device_by_address(&self, addr: SocketAddr) -> Option<Device> {
        lock(&self.devices)
            .values()
            .find(|device| device.address == addr)
            .cloned()
    }

    fn send_or_log(&self, target: SocketAddr, command: RegistryCommand, data: &[u8]) {
        if let Err(e) = self.send_command(target, command as u8, data) {
            debug!(%target, ?command, error = %e, "registry send failed");
        }
    }

    fn on_sync_clock(&self, origin: SocketAddr, data: &[u8]) -> Result<(), WireError> {
        let ts = decode_timestamp(data)?;
        self.clock.restart(ts);
        lock(&self.local).synchronized_timestamp = ts;
        debug!(%origin, ts, "clock restarted by peer");
        self.send_or_log(origin, RegistryCommand::AckSyncClock, &encode_timestamp(ts));
        Ok(())
    }

    fn on_ack(&self, origin: SocketAddr, data: &[u8]) -> Result<(), WireError> {
        let acked = decode_timestamp(data)?;
        let now = self.clock.now();
        let retry = {
            let mut devices = lock(&self.devices);
            let Some(device) = devices.values_mut().find(|d| d.address == origin) else {
                trace!(%origin, "ack from unknown device");
                return Ok(());
            };
            // Only the ack of the handshake in flight measures a round trip.
            if device.sync_state != SyncState::Syncing || acked != device.sync_sent {
                trace!(device = %device.id, acked, expected = device.sync_sent, "stale sync ack ignored");
                return Ok(());
            }
            device.end_sync(acked, now);
            if device.is_synchronized() {
                info!(device = %device.id, accuracy = device.accuracy(), "device synchronized");
                None
            } else {
                debug!(device = %device.id, accuracy = device.accuracy(), "sync accuracy not met, retrying");
                device.start_sync(now)
            }
        };
        if let Some(sent) = retry {
            self.send_or_log(origin, RegistryCommand::SyncClock, &encode_timestamp(sent));
        }
        Ok(())
    }

    fn on_node_data(&self, origin: SocketAddr, data: &[u8]) -> Result<(), WireError> {
        let node = NodeData::decode(data)?;
        if node.device_id == lock(&self.local).device_id {
            return Ok(());
        }
        let id = DeviceId(node.device_id);
        let now = self.clock.now();

        let mut devices = lock(&self.devices);
        if let Some(device) = devices.get_mut(&id) {
            device.update_metadata(&node, now);
            if device.address != origin {
                info!(device = %id, old = %device.address, new = %origin, "device moved");
                device.address = origin;
            }
            return Ok(());
        }

        // An address belongs to a single device.
        let stale: Vec<DeviceId> = devices
            .values()
            .filter(|device| device.address == origin)
            .map(|device| device.id)
            .collect();
        for old in stale {
            warn!(old = %old, new = %id, %origin, "address reused by another device id");
            devices.remove(&old);
        }
        devices.insert(id, Device::discovered(origin, &node, now));
        info!(device = %id, %origin, "device discovered");
        Ok(())
    }
}

impl CommandDispatcher for DeviceRegistry {
    fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn layer(&self) -> &'static str {
        "registry"
    }

    fn execute_command(&self, origin: SocketAddr, command: u8, data: &[u8]) {
        if origin == self.transport.local_addr() {
            return;
        }
        let result = RegistryCommand::try_from(command).and_then(|command| match command {
            RegistryCommand::GetNodeData => {
                let node = self.local_node_data();
                self.send_or_log(origin, RegistryCommand::NodeData, &node.encode());
                Ok(())
            }
            RegistryCommand::SyncClock => self.on_sync_clock(origin, data),
            RegistryCommand::AckSyncClock => self.on_ack(origin, data),
            RegistryCommand::NodeData => self.on_node_data(origin, data),
        });
        if let Err(e) = result {
            debug!(%origin, command, error = %e, "registry packet dropped");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsnet_env::{LinkConditions, ManualClock, MemoryNetwork};

    const PORT: u16 = 7000;

    struct FixedDelay(i64);

    impl LinkConditions for FixedDelay {
        fn route(&self, _from: SocketAddr, _to: SocketAddr) -> Option<i64> {
            Some(self.0)
        }
    }

    struct Node {
        registry: Arc<DeviceRegistry>,
        clock: Arc<ManualClock>,
    }

    struct Lan {
        net: Arc<MemoryNetwork>,
        timeline: ManualClock,
    }

    impl Lan {
        fn new(delay: i64) -> Self {
            let net = MemoryNetwork::new();
            net.set_conditions(Arc::new(FixedDelay(delay)));
            Self {
                net,
                timeline: ManualClock::new(),
            }
        }

        fn node(&self, id: u8, clock_offset: Timestamp) -> Node {
            let transport = self.net.attach(SocketAddr::from(([10, 0, 0, id], PORT))).unwrap();
            let clock = Arc::new(self.timeline.fork(clock_offset));
            let registry = DeviceRegistry::new(transport, clock.clone(), RegistryConfig::new(id, PORT));
            Node { registry, clock }
        }

        fn run(&self, ms: i64) {
            for _ in 0..ms {
                self.timeline.advance(1);
                self.net.deliver_due(self.timeline.timeline_ms());
            }
        }
    }

    #[test]
    fn test_scan_discovers_peers() {
        let lan = Lan::new(1);
        let a = lan.node(1, 0);
        let b = lan.node(2, 0);
        let _c = lan.node(3, 0);

        a.registry.scan();
        lan.run(5);

        let ids: Vec<DeviceId> = a.registry.devices().iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DeviceId(2), DeviceId(3)]);
        assert!(b.registry.devices().is_empty());
        assert_eq!(a.registry.available_devices(100).len(), 2);

        lan.run(200);
        assert!(a.registry.available_devices(100).is_empty());
    }

    #[test]
    fn test_fast_link_synchronizes_clocks() {
        let lan = Lan::new(2);
        let a = lan.node(1, 0);
        let b = lan.node(2, 50_000);

        a.registry.scan();
        lan.run(5);
        a.registry.synchronize_devices();
        lan.run(5);

        let device = a.registry.device(DeviceId(2)).unwrap();
        assert_eq!(device.sync_state, SyncState::Synchronized);
        assert_eq!(device.accuracy(), 4);
        assert!((a.clock.now() - b.clock.now()).abs() <= MIN_CLOCK_ACCURACY);
        assert_eq!(b.registry.local_node_data().synchronized_timestamp, device.synchronized_timestamp);
    }

    #[test]
    fn test_slow_link_keeps_retrying() {
        let lan = Lan::new(8);
        let a = lan.node(1, 0);
        let _b = lan.node(2, 0);

        a.registry.scan();
        lan.run(20);
        a.registry.synchronize_devices();
        let sent_before = a.registry.transport().sent_count();
        lan.run(100);

        let device = a.registry.device(DeviceId(2)).unwrap();
        assert!(!device.is_synchronized());
        assert!(device.accuracy() > MIN_CLOCK_ACCURACY);
        // One retry per round trip of 16 ms.
        assert!(a.registry.transport().sent_count() - sent_before >= 5);
    }

    #[test]
    fn test_pending_handshake_blocks_until_timeout() {
        let lan = Lan::new(1);
        let a = lan.node(1, 0);
        let _b = lan.node(2, 0);

        a.registry.scan();
        lan.run(3);

        // No delivery from here on, so the handshake stays unanswered.
        a.registry.synchronize_devices();
        let sent = a.registry.transport().sent_count();
        lan.timeline.advance(SYNC_TIMEOUT as i64 - 1);
        a.registry.synchronize_devices();
        assert_eq!(a.registry.transport().sent_count(), sent);

        lan.timeline.advance(1);
        a.registry.synchronize_devices();
        assert_eq!(a.registry.transport().sent_count(), sent + 1);
    }

    #[test]
    fn test_late_ack_after_timeout_retry_ignored() {
        let lan = Lan::new(43);
        let a = lan.node(1, 0);
        let b = lan.node(2, 5_000);

        a.registry.scan();
        lan.run(100);
        a.registry.synchronize_devices();
        lan.run(SYNC_TIMEOUT as i64);
        a.registry.synchronize_devices();
        let retry_sent = a.registry.device(DeviceId(2)).unwrap().sync_sent;

        // The first handshake's ack lands 6 ms after the retry went out.
        lan.run(6);
        let device = a.registry.device(DeviceId(2)).unwrap();
        assert_eq!(device.sync_state, SyncState::Syncing);
        assert_eq!(device.sync_sent, retry_sent);

        // The retry's own ack measures the real 86 ms round trip.
        lan.run(80);
        let device = a.registry.device(DeviceId(2)).unwrap();
        assert!(!device.is_synchronized());
        assert!((a.clock.now() - b.clock.now()).abs() > MIN_CLOCK_ACCURACY);
    }

    #[test]
    fn test_ack_must_match_pending_handshake() {
        let lan = Lan::new(0);
        let a = lan.node(1, 0);
        let origin: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let node = NodeData {
            device_id: 5,
            haptics_channel: 0,
            mocap_available: false,
            battery_level: 50,
            synchronized_timestamp: Timestamp::MAX,
        };
        a.registry.execute_command(origin, 2, &node.encode());
        let now = a.clock.now();

        // Not syncing yet.
        a.registry.execute_command(origin, 3, &encode_timestamp(now));
        assert_eq!(a.registry.device(DeviceId(5)).unwrap().sync_state, SyncState::Idle);

        a.registry.synchronize_devices();
        a.registry.execute_command(origin, 3, &encode_timestamp(now.wrapping_sub(1)));
        assert_eq!(a.registry.device(DeviceId(5)).unwrap().sync_state, SyncState::Syncing);

        a.registry.execute_command(origin, 3, &encode_timestamp(now));
        let device = a.registry.device(DeviceId(5)).unwrap();
        assert_eq!(device.sync_state, SyncState::Synchronized);
        assert_eq!(device.synchronized_timestamp, now);

        // A duplicate of the accepted ack changes nothing.
        a.registry.execute_command(origin, 3, &encode_timestamp(now));
        assert!(a.registry.device(DeviceId(5)).unwrap().is_synchronized());
    }

    #[test]
    fn test_second_initiator_invalidates_sync() {
        let lan = Lan::new(1);
        let a = lan.node(1, 0);
        let _b = lan.node(2, 0);
        let c = lan.node(3, 1_000);

        a.registry.scan();
        lan.run(3);
        a.registry.synchronize_devices();
        lan.run(3);
        assert!(a.registry.device(DeviceId(2)).unwrap().is_synchronized());

        c.registry.scan();
        lan.run(3);
        c.registry.synchronize_devices();
        lan.run(3);

        a.registry.scan();
        lan.run(3);
        let device = a.registry.device(DeviceId(2)).unwrap();
        assert_eq!(device.sync_state, SyncState::Desynchronized);
    }

    #[test]
    fn test_address_change_and_reuse() {
        let lan = Lan::new(0);
        let a = lan.node(1, 0);
        let origin: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let moved: SocketAddr = "10.0.0.10:7000".parse().unwrap();
        let node = |id| NodeData {
            device_id: id,
            haptics_channel: 0,
            mocap_available: false,
            battery_level: 50,
            synchronized_timestamp: Timestamp::MAX,
        };

        a.registry.execute_command(origin, 2, &node(5).encode());
        a.registry.execute_command(moved, 2, &node(5).encode());
        assert_eq!(a.registry.device(DeviceId(5)).unwrap().address, moved);

        a.registry.execute_command(moved, 2, &node(6).encode());
        assert!(a.registry.device(DeviceId(5)).is_none());
        assert_eq!(a.registry.device_by_address(moved).unwrap().id, DeviceId(6));
    }

    #[test]
    fn test_haptics_channel_sticks_when_zero_reported() {
        let lan = Lan::new(0);
        let a = lan.node(1, 0);
        let origin: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let mut node = NodeData {
            device_id: 5,
            haptics_channel: 3,
            mocap_available: true,
            battery_level: 80,
            synchronized_timestamp: Timestamp::MAX,
        };
        a.registry.execute_command(origin, 2, &node.encode());
        node.haptics_channel = 0;
        a.registry.execute_command(origin, 2, &node.encode());

        let device = a.registry.device(DeviceId(5)).unwrap();
        assert!(!device.capabilities.haptics);
        assert!(device.capabilities.mocap);
        assert_eq!(device.haptics_channel, 3);
    }

    #[test]
    fn test_own_id_and_malformed_packets_ignored() {
        let lan = Lan::new(0);
        let a = lan.node(1, 0);
        let origin: SocketAddr = "10.0.0.9:7000".parse().unwrap();
        let own = NodeData {
            device_id: 1,
            haptics_channel: 0,
            mocap_available: false,
            battery_level: 0,
            synchronized_timestamp: 0,
        };

        a.registry.execute_command(origin, 2, &own.encode());
        a.registry.execute_command(origin, 2, &[1, 2, 3]);
        a.registry.execute_command(origin, 1, &[1]);
        a.registry.execute_command(origin, 42, &[]);
        assert!(a.registry.devices().is_empty());
        assert_eq!(a.registry.local_node_data().synchronized_timestamp, Timestamp::MAX);
    }

    #[test]
    fn test_scan_targets() {
        let lan = Lan::new(0);
        let a = lan.node(1, 0);
        let extra: SocketAddr = "10.0.1.1:7000".parse().unwrap();

        a.registry.add_scan_target(extra);
        a.registry.add_scan_target(extra);
        a.registry.scan();
        // Broadcast plus one unreachable unicast (not counted).
        assert_eq!(a.registry.transport().sent_count(), 1);

        a.registry.remove_scan_target(extra);
        let _b = lan.node(2, 0);
        a.registry.scan();
        assert_eq!(a.registry.transport().sent_count(), 2);
    }
}
