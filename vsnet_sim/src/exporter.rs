//! JSON export of delivery latencies.
//!
//! Every update applied on a replica is recorded as `(element, timestamp,
//! applied_at)`; the difference is the effective delay the degradation
//! produced.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use vsnet_core::ElementInfo;
use vsnet_env::Timestamp;

/// One applied update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySample {
    /// Receiving node
    pub node: usize,
    pub channel: u8,
    pub element: u64,
    /// Sender timestamp
    pub timestamp: Timestamp,
    /// Receiver clock when applied
    pub applied_at: Timestamp,
}

impl LatencySample {
    pub fn new(node: usize, channel: u8, element: ElementInfo, timestamp: Timestamp, applied_at: Timestamp) -> Self {
        Self {
            node,
            channel,
            element: element.id,
            timestamp,
            applied_at,
        }
    }

    pub fn delay(&self) -> Timestamp {
        self.applied_at.wrapping_sub(self.timestamp)
    }
}

/// Aggregate delay statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DelaySummary {
    pub count: usize,
    pub min_ms: Timestamp,
    pub max_ms: Timestamp,
    pub mean_ms: f64,
}

impl DelaySummary {
    pub fn of(samples: &[LatencySample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let delays = samples.iter().map(LatencySample::delay);
        Self {
            count: samples.len(),
            min_ms: delays.clone().min().unwrap_or(0),
            max_ms: delays.clone().max().unwrap_or(0),
            mean_ms: delays.map(f64::from).sum::<f64>() / samples.len() as f64,
        }
    }
}

/// Complete latency export of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyExport {
    pub scenario: String,
    pub seed: u64,
    pub passed: bool,
    pub summary: DelaySummary,
    pub samples: Vec<LatencySample>,
}

impl LatencyExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            passed: false,
            summary: DelaySummary::default(),
            samples: Vec::new(),
        }
    }

    pub fn add_samples(&mut self, samples: impl IntoIterator<Item = LatencySample>) {
        self.samples.extend(samples);
        self.summary = DelaySummary::of(&self.samples);
    }

    pub fn finalize(&mut self, passed: bool) {
        self.passed = passed;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
