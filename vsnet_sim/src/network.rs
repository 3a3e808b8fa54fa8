//! Link-level fault injection for the in-memory network.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use vsnet_env::LinkConditions;

/// Latency, jitter and loss of one direction of a link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkProfile {
    /// One-way latency in milliseconds
    pub latency_ms: f64,

    /// Standard deviation of the latency in milliseconds
    pub jitter_ms: f64,

    /// Probability of dropping a datagram (0.0 - 1.0)
    pub loss_rate: f64,
}

impl LinkProfile {
    pub const PERFECT: LinkProfile = LinkProfile {
        latency_ms: 0.0,
        jitter_ms: 0.0,
        loss_rate: 0.0,
    };

    pub fn new(latency_ms: f64, jitter_ms: f64, loss_rate: f64) -> Self {
        Self {
            latency_ms: latency_ms.max(0.0),
            jitter_ms: jitter_ms.max(0.0),
            loss_rate: loss_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for LinkProfile {
    fn default() -> Self {
        Self::PERFECT
    }
}

/// Network controller for fault injection.
///
/// Links are keyed by host address, so a node's registry and session
/// endpoints share the same conditions. All randomness comes from one seeded
/// generator; for a fixed seed and send order the routing decisions repeat.
pub struct SimNetworkController {
    rng: Mutex<ChaCha8Rng>,
    default_profile: Mutex<LinkProfile>,
    links: Mutex<HashMap<(IpAddr, IpAddr), LinkProfile>>,
    partitions: Mutex<Vec<(Vec<IpAddr>, Vec<IpAddr>)>>,
    routed: AtomicU64,
    lost: AtomicU64,
    partitioned: AtomicU64,
}

impl SimNetworkController {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
            default_profile: Mutex::new(LinkProfile::PERFECT),
            links: Mutex::new(HashMap::new()),
            partitions: Mutex::new(Vec::new()),
            routed: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            partitioned: AtomicU64::new(0),
        }
    }

    /// Conditions of every link without an explicit profile.
    pub fn set_default_profile(&self, profile: LinkProfile) {
        *lock(&self.default_profile) = profile;
    }

    pub fn default_profile(&self) -> LinkProfile {
        *lock(&self.default_profile)
    }

    /// Sets the conditions from `from` to `to`. The reverse direction is separate.
    pub fn set_link(&self, from: IpAddr, to: IpAddr, profile: LinkProfile) {
        lock(&self.links).insert((from, to), profile);
    }

    pub fn set_latency(&self, from: IpAddr, to: IpAddr, latency_ms: f64) {
        let mut profile = self.link(from, to);
        profile.latency_ms = latency_ms.max(0.0);
        self.set_link(from, to, profile);
    }

    pub fn set_loss(&self, from: IpAddr, to: IpAddr, loss_rate: f64) {
        let mut profile = self.link(from, to);
        profile.loss_rate = loss_rate.clamp(0.0, 1.0);
        self.set_link(from, to, profile);
    }

    /// Conditions from `from` to `to`.
    pub fn link(&self, from: IpAddr, to: IpAddr) -> LinkProfile {
        lock(&self.links)
            .get(&(from, to))
            .copied()
            .unwrap_or_else(|| self.default_profile())
    }

    /// Creates a network partition between two groups.
    pub fn partition(&self, group_a: Vec<IpAddr>, group_b: Vec<IpAddr>) {
        lock(&self.partitions).push((group_a, group_b));
    }

    /// Heals all active partitions.
    pub fn heal_all(&self) {
        lock(&self.partitions).clear();
    }

    /// Checks if two hosts can communicate (not partitioned).
    pub fn can_communicate(&self, from: IpAddr, to: IpAddr) -> bool {
        !lock(&self.partitions).iter().any(|(a, b)| {
            (a.contains(&from) && b.contains(&to)) || (b.contains(&from) && a.contains(&to))
        })
    }

    /// Datagrams given a delivery time.
    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }

    /// Datagrams dropped by random loss.
    pub fn lost_count(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Datagrams dropped by a partition.
    pub fn partitioned_count(&self) -> u64 {
        self.partitioned.load(Ordering::Relaxed)
    }
}

impl LinkConditions for SimNetworkController {
    fn route(&self, from: SocketAddr, to: SocketAddr) -> Option<i64> {
        let (from, to) = (from.ip(), to.ip());
        if !self.can_communicate(from, to) {
            self.partitioned.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let profile = self.link(from, to);
        let mut rng = lock(&self.rng);
        if profile.loss_rate > 0.0 && rng.gen_bool(profile.loss_rate) {
            self.lost.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let latency = match Normal::new(profile.latency_ms, profile.jitter_ms) {
            Ok(normal) if profile.jitter_ms > 0.0 => normal.sample(&mut *rng),
            _ => profile.latency_ms,
        };
        self.routed.fetch_add(1, Ordering::Relaxed);
        Some(latency.round().max(0.0) as i64)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn host(n: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, n])
    }

    fn endpoint(n: u8) -> SocketAddr {
        SocketAddr::new(host(n), 7000)
    }

    #[test]
    fn test_network_controller_partition() {
        let controller = SimNetworkController::new(1);
        let (a, b, c) = (host(1), host(2), host(3));

        assert!(controller.can_communicate(a, b));
        controller.partition(vec![a], vec![b, c]);
        assert!(!controller.can_communicate(a, b));
        assert!(!controller.can_communicate(c, a));
        assert!(controller.can_communicate(b, c));

        assert_eq!(controller.route(endpoint(1), endpoint(2)), None);
        assert_eq!(controller.partitioned_count(), 1);

        controller.heal_all();
        assert_eq!(controller.route(endpoint(1), endpoint(2)), Some(0));
    }

    #[test]
    fn test_network_controller_latency() {
        let controller = SimNetworkController::new(1);
        let (a, b) = (host(1), host(2));

        controller.set_latency(a, b, 12.4);
        assert_eq!(controller.route(endpoint(1), endpoint(2)), Some(12));
        // Reverse direction is separate
        assert_eq!(controller.route(endpoint(2), endpoint(1)), Some(0));

        controller.set_default_profile(LinkProfile::new(30.0, 0.0, 0.0));
        assert_eq!(controller.route(endpoint(2), endpoint(1)), Some(30));
        assert_eq!(controller.routed_count(), 3);
    }

    #[test]
    fn test_total_loss() {
        let controller = SimNetworkController::new(1);
        controller.set_loss(host(1), host(2), 1.0);
        for _ in 0..20 {
            assert_eq!(controller.route(endpoint(1), endpoint(2)), None);
        }
        assert_eq!(controller.lost_count(), 20);
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let run = |seed| {
            let controller = SimNetworkController::new(seed);
            controller.set_default_profile(LinkProfile::new(20.0, 5.0, 0.3));
            (0..200)
                .map(|_| controller.route(endpoint(1), endpoint(2)))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
        assert_ne!(run(7), run(8));
    }

    proptest! {
        #[test]
        fn prop_latency_never_negative(latency in 0.0f64..50.0, jitter in 0.0f64..100.0, seed in any::<u64>()) {
            let controller = SimNetworkController::new(seed);
            controller.set_default_profile(LinkProfile::new(latency, jitter, 0.0));
            for _ in 0..20 {
                let delay = controller.route(endpoint(1), endpoint(2));
                prop_assert!(delay.is_some_and(|d| d >= 0));
            }
        }
    }
}
