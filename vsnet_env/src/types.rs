//! Common types for the vsnet environment abstraction.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Millisecond timestamp on a [`Clock`](crate::Clock).
///
/// Signed 32-bit with wrapping arithmetic, so it fits the wire header and
/// differences stay meaningful across a wrap.
pub type Timestamp = i32;

/// A datagram as handed to a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Endpoint the datagram came from (the peer's bound socket)
    pub origin: SocketAddr,

    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Creates a new datagram.
    pub fn new(origin: SocketAddr, payload: Vec<u8>) -> Self {
        Self { origin, payload }
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// Identifier a device advertises in discovery replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u8);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Returns the limited broadcast endpoint for `port`.
pub fn broadcast_endpoint(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)
}

/// Returns true if `addr` targets the limited broadcast address.
pub fn is_broadcast(addr: &SocketAddr) -> bool {
    matches!(addr.ip(), IpAddr::V4(ip) if ip.is_broadcast())
}

/// Returns `addr` with its port replaced.
///
/// Peers use the same port convention per protocol layer, so a device
/// discovered on the registry port is reached on `port` for another layer.
pub fn with_port(addr: SocketAddr, port: u16) -> SocketAddr {
    SocketAddr::new(addr.ip(), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_detection() {
        assert!(is_broadcast(&broadcast_endpoint(7000)));
        assert!(!is_broadcast(&"192.168.1.20:7000".parse().unwrap()));
        assert!(!is_broadcast(&"[::1]:7000".parse().unwrap()));
    }

    #[test]
    fn test_with_port_keeps_ip() {
        let addr: SocketAddr = "10.0.0.7:5000".parse().unwrap();
        assert_eq!(with_port(addr, 6000), "10.0.0.7:6000".parse().unwrap());
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(3).to_string(), "dev#3");
    }
}
