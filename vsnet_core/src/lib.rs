//! vsnet Core - Time-stamped state replication between devices
//!
//! This library replicates scenario elements (body poses, haptic stimuli,
//! sensor readings) over an unreliable datagram transport and lets the
//! delivery of remote updates be degraded on purpose:
//! 1. **Discovery & clock sync**: broadcast node data and a two-phase
//!    handshake per peer, with no central time server ([`DeviceRegistry`])
//! 2. **Replication**: numbered pub/sub channels of host elements and remote
//!    replicas ([`ScenarioSession`], [`Channel`])
//! 3. **Degradation**: immediate, statistical or recorded-trace release of
//!    buffered updates ([`QosManager`])
//!
//! # Example
//!
//! ```ignore
//! use vsnet_core::{DeviceRegistry, RegistryConfig, ScenarioSession, SessionDriver, DriverConfig};
//! use vsnet_core::elements::MoCapPose;
//!
//! let registry = DeviceRegistry::new(registry_transport, clock, RegistryConfig::new(6, 11000));
//! let session = ScenarioSession::new(session_transport, registry);
//! let poses = session.add_channel::<MoCapPose>(4, None)?;
//! poses.subscribe_to(peer_session_addr)?;
//! let driver = SessionDriver::spawn(session, DriverConfig::default())?;
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod element;
pub mod elements;
pub mod error;
pub mod qos;
pub mod registry;
pub mod session;
pub mod wire;

// Re-export key types for convenience
pub use channel::{Channel, ChannelHandle, NewRemoteCallback, UpdateObserver};
pub use config::{DetectionArea, InitData, SessionConfig};
pub use dispatch::{build_command_package, CommandDispatcher};
pub use driver::{DriverConfig, SessionDriver};
pub use element::{ElementHandle, ElementIdGenerator, ElementInfo, PendingBuffer, ScenarioElement, UpdateCallback};
pub use error::{ConfigError, QosError, SessionError, WireError};
pub use qos::{QosConfiguration, QosManager, QosMode, Recording};
pub use registry::{Capabilities, Device, DeviceRegistry, RegistryConfig, SyncState};
pub use session::{build_session_package, ScenarioSession, SessionCommand};
pub use wire::{Header, NodeData};
