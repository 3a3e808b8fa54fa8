//! Named replication and degradation scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Peer-to-peer clock synchronization from random offsets
    ClockSync,

    /// Streamed body pose followed by every subscriber
    PoseReplication,

    /// Recorded delay trace replayed twice with identical results
    RecordedReplay,

    /// Poisson burst release of a sensor stream
    PoissonBurst,

    /// Haptic command echoed back to its sender
    HapticLoopback,

    /// Pose streaming over a link losing 30% of datagrams
    LossyLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::ClockSync,
            ScenarioId::PoseReplication,
            ScenarioId::RecordedReplay,
            ScenarioId::PoissonBurst,
            ScenarioId::HapticLoopback,
            ScenarioId::LossyLink,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::ClockSync => "clock_sync",
            ScenarioId::PoseReplication => "pose_replication",
            ScenarioId::RecordedReplay => "recorded_replay",
            ScenarioId::PoissonBurst => "poisson_burst",
            ScenarioId::HapticLoopback => "haptic_loopback",
            ScenarioId::LossyLink => "lossy_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::ClockSync => "Random clock offsets, verify every follower synchronizes within 10 ms",
            ScenarioId::PoseReplication => "Moving body streamed to all nodes, verify replicas track it",
            ScenarioId::RecordedReplay => "Recorded trace {20 ms: 0,5,0,10}, verify identical replays",
            ScenarioId::PoissonBurst => "Poisson(1.2) release of a heart-rate stream, verify order and drain",
            ScenarioId::HapticLoopback => "Haptic amplitude echoed back, verify every change returns",
            ScenarioId::LossyLink => "30% packet loss, verify streamed pose still converges",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clock_sync" | "clocksync" => Ok(ScenarioId::ClockSync),
            "pose_replication" | "posereplication" => Ok(ScenarioId::PoseReplication),
            "recorded_replay" | "recordedreplay" => Ok(ScenarioId::RecordedReplay),
            "poisson_burst" | "poissonburst" => Ok(ScenarioId::PoissonBurst),
            "haptic_loopback" | "hapticloopback" => Ok(ScenarioId::HapticLoopback),
            "lossy_link" | "lossylink" => Ok(ScenarioId::LossyLink),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("LossyLink".parse::<ScenarioId>(), Ok(ScenarioId::LossyLink));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
