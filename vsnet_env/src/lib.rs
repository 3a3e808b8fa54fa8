//! vsnet Environment Abstraction Layer
//!
//! This crate isolates the two pieces of the outside world the replication
//! engines depend on, so the same engines run against real sockets or against
//! a deterministic in-process network:
//! - Time (`Clock::now()`, `restart(offset)`)
//! - Datagrams (`Transport::send()`, receive callback or inbound queue)
//!
//! # Implementations
//!
//! | Concern  | Production       | Simulation / tests                 |
//! |----------|------------------|------------------------------------|
//! | Clock    | [`NetClock`]     | [`ManualClock`]                    |
//! | Network  | [`UdpTransport`] | [`MemoryNetwork`] + [`MemoryTransport`] |
//!
//! # Example
//!
//! ```ignore
//! use vsnet_env::{MemoryNetwork, Transport};
//!
//! let net = MemoryNetwork::new();
//! let a = net.attach("10.0.0.1:7000".parse()?)?;
//! let b = net.attach("10.0.0.2:7000".parse()?)?;
//! a.send(b.local_addr(), vec![1, 2, 3])?;
//! net.deliver_due(0);
//! assert!(b.try_recv().is_some());
//! ```

mod clock;
mod error;
mod manual_clock;
mod memory;
mod net_clock;
mod network;
mod types;
mod udp;

pub use clock::{elapsed_between, is_due, Clock};
pub use error::EnvError;
pub use manual_clock::ManualClock;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use net_clock::NetClock;
pub use network::{LinkConditions, ReceiveCallback, Transport};
pub use types::{broadcast_endpoint, is_broadcast, with_port, Datagram, DeviceId, Timestamp};
pub use udp::{UdpConfig, UdpTransport};
