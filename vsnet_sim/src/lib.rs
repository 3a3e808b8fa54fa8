//! vsnet Deterministic Simulation Harness
//!
//! Runs several complete vsnet devices (registry + session each) inside one
//! process, over an in-memory network, under a single manual timeline.
//!
//! # Core Principle
//!
//! Nothing moves unless [`SimWorld::step`] moves it:
//! - **Time**: node clocks are offset forks of one manual timeline
//! - **Network**: datagrams are delayed, dropped or partitioned by a seeded controller
//! - **Randomness**: clock offsets and link faults derive from one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         SimWorld                          │
//! │   timeline (ManualClock) ──fork(offset)──► node clocks    │
//! │                                                           │
//! │  ┌──────────────┐                    ┌──────────────┐     │
//! │  │   SimNode 0  │                    │   SimNode 1  │ ... │
//! │  │ registry     │◄──MemoryNetwork───►│ registry     │     │
//! │  │ session      │   (deliver_due)    │ session      │     │
//! │  └──────────────┘                    └──────────────┘     │
//! │                 ▲                                         │
//! │        SimNetworkController (latency, loss, partitions)   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use vsnet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 3).run(ScenarioId::ClockSync);
//! assert!(result.passed);
//! ```

mod error;
mod exporter;
mod network;
mod runner;
pub mod scenarios;
mod trace;
mod world;

pub use error::SimError;
pub use exporter::{DelaySummary, LatencyExport, LatencySample};
pub use network::{LinkProfile, SimNetworkController};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use trace::TraceSynthesizer;
pub use world::{SimConfig, SimNode, SimWorld};
