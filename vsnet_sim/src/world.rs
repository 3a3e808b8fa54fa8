//! SimWorld - the simulation harness container.

use crate::error::SimError;
use crate::network::{LinkProfile, SimNetworkController};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::debug;
use vsnet_core::{CommandDispatcher, DeviceRegistry, RegistryConfig, ScenarioSession, SyncState};
use vsnet_env::{Clock, ManualClock, MemoryNetwork, Timestamp, Transport};

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Number of nodes to create
    pub num_nodes: usize,

    /// Session tick period in milliseconds
    pub tick_ms: i64,

    /// Discovery scan period in milliseconds
    pub scan_period_ms: i64,

    /// Clock sync round period in milliseconds
    pub sync_period_ms: i64,

    /// Index of the node that synchronizes everyone else's clock
    pub sync_initiator: usize,

    /// Initial clock offsets are drawn from `0..max_clock_offset_ms`
    pub max_clock_offset_ms: Timestamp,

    pub registry_port: u16,
    pub session_port: u16,

    /// Conditions of every link
    pub link: LinkProfile,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_nodes: 3,
            tick_ms: 20,
            scan_period_ms: 200,
            sync_period_ms: 500,
            sync_initiator: 0,
            max_clock_offset_ms: 60_000,
            registry_port: 11000,
            session_port: 11001,
            link: LinkProfile::new(2.0, 0.5, 0.0),
        }
    }
}

/// One simulated device: a registry and a session sharing one clock.
pub struct SimNode {
    pub index: usize,
    pub host: IpAddr,
    pub clock: Arc<ManualClock>,
    pub registry: Arc<DeviceRegistry>,
    pub session: Arc<ScenarioSession>,
}

impl SimNode {
    pub fn session_addr(&self) -> SocketAddr {
        self.session.local_addr()
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}

/// The SimWorld - container for the entire simulation.
///
/// Time only moves in [`SimWorld::step`]: the shared timeline advances one
/// millisecond at a time, due datagrams are delivered after every
/// millisecond, and sessions tick every `tick_ms`.
pub struct SimWorld {
    pub config: SimConfig,

    /// Master timeline; node clocks are forks of it
    pub timeline: Arc<ManualClock>,

    pub network: Arc<MemoryNetwork>,

    /// Network controller for fault injection
    pub controller: Arc<SimNetworkController>,

    nodes: Vec<SimNode>,
    elapsed_ms: i64,
    tick_count: u64,
    since_tick: i64,
    since_scan: Option<i64>,
    since_sync: Option<i64>,
}

impl SimWorld {
    /// Creates the network and every node.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        if config.tick_ms <= 0 {
            return Err(SimError::invalid("tick period", config.tick_ms as f64));
        }
        // Separate streams for link faults and clock offsets
        let link_seed = config.seed.wrapping_mul(0x9e3779b97f4a7c15);
        let mut offsets = ChaCha8Rng::seed_from_u64(config.seed);

        let timeline = ManualClock::shared();
        let network = MemoryNetwork::new();
        let controller = Arc::new(SimNetworkController::new(link_seed));
        controller.set_default_profile(config.link);
        network.set_conditions(controller.clone());

        let mut nodes = Vec::with_capacity(config.num_nodes);
        for index in 0..config.num_nodes {
            let host = node_host(index)?;
            let offset = if config.max_clock_offset_ms > 0 {
                offsets.gen_range(0..config.max_clock_offset_ms)
            } else {
                0
            };
            let clock = Arc::new(timeline.fork(offset));
            let device_id = u8::try_from(index + 1).map_err(|_| SimError::invalid("node count", index as f64))?;

            let registry_transport = network.attach(SocketAddr::new(host, config.registry_port))?;
            let session_transport = network.attach(SocketAddr::new(host, config.session_port))?;
            let registry = DeviceRegistry::new(
                registry_transport,
                clock.clone(),
                RegistryConfig::new(device_id, config.registry_port),
            );
            let session = ScenarioSession::new(session_transport, Arc::clone(&registry));
            debug!(index, %host, offset, "sim node created");
            nodes.push(SimNode {
                index,
                host,
                clock,
                registry,
                session,
            });
        }

        Ok(Self {
            config,
            timeline,
            network,
            controller,
            nodes,
            elapsed_ms: 0,
            tick_count: 0,
            since_tick: 0,
            since_scan: None,
            since_sync: None,
        })
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Advances the world by `dt_ms` milliseconds.
    pub fn step(&mut self, dt_ms: i64) {
        for _ in 0..dt_ms.max(0) {
            self.run_registry_cycles();
            self.timeline.advance(1);
            self.elapsed_ms += 1;
            self.network.deliver_due(self.timeline.timeline_ms());

            self.since_tick += 1;
            if self.since_tick >= self.config.tick_ms {
                self.since_tick = 0;
                self.tick_sessions();
            }
        }
    }

    /// Ticks every session once, in node order.
    pub fn tick_sessions(&mut self) {
        for node in &self.nodes {
            node.session.tick();
        }
        self.tick_count += 1;
    }

    fn run_registry_cycles(&mut self) {
        let scan_due = self
            .since_scan
            .map_or(true, |at| self.elapsed_ms - at >= self.config.scan_period_ms);
        if scan_due {
            self.since_scan = Some(self.elapsed_ms);
            for node in &self.nodes {
                node.registry.scan();
            }
        }

        let sync_due = self
            .since_sync
            .map_or(true, |at| self.elapsed_ms - at >= self.config.sync_period_ms);
        if sync_due {
            self.since_sync = Some(self.elapsed_ms);
            if let Some(initiator) = self.nodes.get(self.config.sync_initiator) {
                initiator.registry.synchronize_devices();
            }
        }
    }

    /// True when the initiator has synchronized every other node.
    pub fn all_synchronized(&self) -> bool {
        let Some(initiator) = self.nodes.get(self.config.sync_initiator) else {
            return false;
        };
        let devices = initiator.registry.devices();
        devices.len() + 1 == self.nodes.len()
            && devices.iter().all(|device| device.sync_state == SyncState::Synchronized)
    }

    /// Steps until every node is synchronized or `limit_ms` has passed.
    /// Returns the time it took.
    pub fn run_until_synchronized(&mut self, limit_ms: i64) -> Option<i64> {
        let started = self.elapsed_ms;
        while self.elapsed_ms - started < limit_ms {
            if self.all_synchronized() {
                return Some(self.elapsed_ms - started);
            }
            self.step(1);
        }
        self.all_synchronized().then_some(self.elapsed_ms - started)
    }

    /// Largest difference between the initiator's clock and any other node's.
    pub fn max_clock_skew(&self) -> Timestamp {
        let Some(initiator) = self.nodes.get(self.config.sync_initiator) else {
            return 0;
        };
        let reference = initiator.now();
        self.nodes
            .iter()
            .map(|node| node.now().wrapping_sub(reference).wrapping_abs())
            .max()
            .unwrap_or(0)
    }

    /// Datagrams sent by every node's transports.
    pub fn packets_sent(&self) -> u64 {
        self.nodes
            .iter()
            .map(|node| node.registry.transport().sent_count() + node.session.transport().sent_count())
            .sum()
    }

    /// Milliseconds simulated so far.
    pub fn elapsed_ms(&self) -> i64 {
        self.elapsed_ms
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Closes every session.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.session.close();
            node.registry.transport().shutdown();
        }
    }
}

fn node_host(index: usize) -> Result<IpAddr, SimError> {
    let n = u16::try_from(index + 1).map_err(|_| SimError::invalid("node count", index as f64))?;
    if n > 254 * 254 {
        return Err(SimError::invalid("node count", f64::from(n)));
    }
    let [high, low] = n.to_be_bytes();
    Ok(IpAddr::V4(Ipv4Addr::new(10, 0, high, low)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SimConfig {
        SimConfig {
            link: LinkProfile::new(2.0, 0.0, 0.0),
            ..SimConfig::default()
        }
    }

    #[test]
    fn test_sim_world_creation() {
        let world = SimWorld::new(SimConfig {
            num_nodes: 4,
            ..quiet()
        })
        .unwrap();
        assert_eq!(world.node_count(), 4);
        assert_eq!(world.network.endpoints().len(), 8);
        assert_eq!(world.node(3).unwrap().registry.local_id().0, 4);
        assert!(world.node(4).is_none());
    }

    #[test]
    fn test_sim_world_step() {
        let mut world = SimWorld::new(quiet()).unwrap();
        assert_eq!(world.tick_count(), 0);
        world.step(100);
        assert_eq!(world.elapsed_ms(), 100);
        assert_eq!(world.tick_count(), 5);
        assert_eq!(world.timeline.timeline_ms(), 100);
    }

    #[test]
    fn test_clock_convergence() {
        let mut world = SimWorld::new(quiet()).unwrap();
        let took = world.run_until_synchronized(3_000);
        assert!(took.is_some());
        // Followers lag the initiator by one-way latency.
        assert!(world.max_clock_skew() <= vsnet_core::registry::MIN_CLOCK_ACCURACY);
    }

    #[test]
    fn test_discovery_between_all_nodes() {
        let mut world = SimWorld::new(quiet()).unwrap();
        world.step(50);
        for node in world.nodes() {
            assert_eq!(node.registry.devices().len(), world.node_count() - 1);
        }
        assert!(world.packets_sent() > 0);
    }

    #[test]
    fn test_same_seed_same_offsets() {
        let a = SimWorld::new(quiet()).unwrap();
        let b = SimWorld::new(quiet()).unwrap();
        let offsets = |w: &SimWorld| w.nodes().iter().map(SimNode::now).collect::<Vec<_>>();
        assert_eq!(offsets(&a), offsets(&b));
    }

    #[test]
    fn test_shutdown_detaches_everything() {
        let world = SimWorld::new(quiet()).unwrap();
        world.shutdown();
        assert!(world.network.endpoints().is_empty());
        assert_eq!(world.node(0).unwrap().session.transport().sent_count(), 0);
    }

    #[test]
    fn test_zero_tick_rejected() {
        assert!(SimWorld::new(SimConfig {
            tick_ms: 0,
            ..quiet()
        })
        .is_err());
    }
}
