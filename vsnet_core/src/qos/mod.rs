//! Quality-of-service degradation of replicated updates.
//!
//! Every remote element buffers incoming updates by sender timestamp; once
//! per tick the channel hands that buffer to [`QosManager::drain`], which is
//! the only place pending updates are applied. The active strategy decides
//! how many of them are released:
//!
//! | Mode                  | Release rule                                         |
//! |-----------------------|------------------------------------------------------|
//! | `NotDegraded`         | every entry with `t <= now`, in timestamp order      |
//! | `RandomDegradation`   | constant delay (`t <= now - d`) or Poisson burst     |
//! | `RecordedDegradation` | re-stamp to `t + trace(t)`, then `t' <= now`         |

mod jitter;
mod recording;

pub use jitter::{ConstantDelay, ConstantParams, Distribution, JitterModel, PoissonJitter, PoissonParams};
pub use recording::Recording;

use crate::element::PendingBuffer;
use crate::error::QosError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;
use vsnet_env::{is_due, Clock, Timestamp};

/// Degradation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QosMode {
    #[default]
    NotDegraded,
    RandomDegradation,
    RecordedDegradation,
}

/// Persisted form of a [`QosManager`]'s strategy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QosConfiguration {
    pub mode: QosMode,
    #[serde(default)]
    pub distribution: Distribution,
    /// JSON parameters of the jitter model
    #[serde(default)]
    pub serialized_jitter_params: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<Recording>,
}

/// The active release policy.
#[derive(Debug, Clone)]
pub enum QosStrategy {
    Immediate,
    Random(JitterModel),
    Recorded(Recording),
}

impl QosStrategy {
    pub fn mode(&self) -> QosMode {
        match self {
            Self::Immediate => QosMode::NotDegraded,
            Self::Random(_) => QosMode::RandomDegradation,
            Self::Recorded(_) => QosMode::RecordedDegradation,
        }
    }
}

/// Applies the configured degradation to pending updates.
///
/// One manager may be shared by several channels so that they degrade
/// together (e.g. position and orientation of the same tracked body).
pub struct QosManager {
    clock: Arc<dyn Clock>,
    strategy: Mutex<QosStrategy>,
}

impl QosManager {
    /// Creates a manager with no degradation.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            strategy: Mutex::new(QosStrategy::Immediate),
        }
    }

    pub fn with_configuration(clock: Arc<dyn Clock>, config: &QosConfiguration) -> Result<Self, QosError> {
        let manager = Self::new(clock);
        manager.set_configuration(config)?;
        Ok(manager)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn mode(&self) -> QosMode {
        self.lock().mode()
    }

    pub fn strategy(&self) -> QosStrategy {
        self.lock().clone()
    }

    pub fn set_no_degradation(&self) {
        *self.lock() = QosStrategy::Immediate;
        info!("QoS: no degradation");
    }

    pub fn set_random_degradation(&self, model: JitterModel) {
        info!(distribution = %model.distribution(), params = %model.serialized(), "QoS: random degradation");
        *self.lock() = QosStrategy::Random(model);
    }

    pub fn set_recorded_degradation(&self, recording: Recording) {
        info!(
            period = recording.period,
            slots = recording.delay.len(),
            "QoS: recorded degradation"
        );
        *self.lock() = QosStrategy::Recorded(recording);
    }

    /// Switches strategy from a persisted configuration.
    ///
    /// # Errors
    /// Invalid jitter parameters, `RandomDegradation` without a distribution,
    /// or a recording with a non-positive period. The current strategy is
    /// kept on error.
    pub fn set_configuration(&self, config: &QosConfiguration) -> Result<(), QosError> {
        match config.mode {
            QosMode::NotDegraded => self.set_no_degradation(),
            QosMode::RandomDegradation => {
                let model = JitterModel::from_serialized(config.distribution, &config.serialized_jitter_params)?
                    .ok_or_else(|| QosError::UnknownDistribution(config.distribution.to_string()))?;
                self.set_random_degradation(model);
            }
            QosMode::RecordedDegradation => {
                let recording = config.recording.clone().unwrap_or_default();
                recording.validate()?;
                self.set_recorded_degradation(recording);
            }
        }
        Ok(())
    }

    pub fn get_configuration(&self) -> QosConfiguration {
        match &*self.lock() {
            QosStrategy::Immediate => QosConfiguration::default(),
            QosStrategy::Random(model) => QosConfiguration {
                mode: QosMode::RandomDegradation,
                distribution: model.distribution(),
                serialized_jitter_params: model.serialized(),
                recording: None,
            },
            QosStrategy::Recorded(recording) => QosConfiguration {
                mode: QosMode::RecordedDegradation,
                recording: Some(recording.clone()),
                ..QosConfiguration::default()
            },
        }
    }

    /// Restarts the recorded trace at the current time. No-op in other modes.
    pub fn reset_recording(&self) {
        let now = self.clock.now();
        if let QosStrategy::Recorded(recording) = &mut *self.lock() {
            recording.set_time_origin(now);
        }
    }

    /// Releases pending updates according to the active strategy.
    ///
    /// `apply` receives `(sender timestamp, payload)` in release order and must
    /// not call back into this manager. Returns the number released.
    pub fn drain(&self, buffer: &mut PendingBuffer, apply: &mut dyn FnMut(Timestamp, Vec<u8>)) -> usize {
        let now = self.clock.now();
        let mut strategy = self.lock();
        match &mut *strategy {
            QosStrategy::Recorded(recording) => recording.drain(buffer, now, apply),
            other => {
                // Left over from a previous recorded strategy.
                let mut applied = release_degraded(buffer, now, apply);
                applied += match other {
                    QosStrategy::Random(model) => model.drain(buffer, now, apply),
                    _ => drain_immediate(buffer, now, apply),
                };
                applied
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QosStrategy> {
        self.strategy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn drain_immediate(buffer: &mut PendingBuffer, now: Timestamp, apply: &mut dyn FnMut(Timestamp, Vec<u8>)) -> usize {
    let mut applied = 0;
    while buffer.earliest().is_some_and(|ts| is_due(ts, now)) {
        let Some((ts, payload)) = buffer.pop_incoming() else {
            break;
        };
        apply(ts, payload);
        applied += 1;
    }
    applied
}

fn release_degraded(buffer: &mut PendingBuffer, now: Timestamp, apply: &mut dyn FnMut(Timestamp, Vec<u8>)) -> usize {
    let mut applied = 0;
    while buffer.degraded.first_key_value().is_some_and(|(due, _)| is_due(*due, now)) {
        let Some((_, (ts, payload))) = buffer.degraded.pop_first() else {
            break;
        };
        apply(ts, payload);
        applied += 1;
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vsnet_env::ManualClock;

    fn manager_at(now: i64) -> (QosManager, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        clock.advance(now);
        (QosManager::new(clock.clone()), clock)
    }

    fn filled(stamps: &[Timestamp]) -> PendingBuffer {
        let mut buffer = PendingBuffer::default();
        for ts in stamps {
            buffer.push(*ts, vec![]);
        }
        buffer
    }

    fn drained(manager: &QosManager, buffer: &mut PendingBuffer) -> Vec<Timestamp> {
        let mut out = Vec::new();
        manager.drain(buffer, &mut |ts, _| out.push(ts));
        out
    }

    #[test]
    fn test_immediate_applies_in_timestamp_order() {
        let (manager, _clock) = manager_at(130);
        let mut buffer = filled(&[100, 120, 115]);
        assert_eq!(drained(&manager, &mut buffer), vec![100, 115, 120]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_immediate_holds_future_entries() {
        let (manager, clock) = manager_at(100);
        let mut buffer = filled(&[90, 101, 150]);
        assert_eq!(drained(&manager, &mut buffer), vec![90]);
        clock.advance(50);
        assert_eq!(drained(&manager, &mut buffer), vec![101, 150]);
    }

    #[test]
    fn test_immediate_releases_across_clock_wrap() {
        let clock = ManualClock::shared();
        clock.restart(Timestamp::MAX - 10);
        clock.advance(15);
        let manager = QosManager::new(clock.clone());
        assert_eq!(manager.now(), Timestamp::MIN + 4);

        let mut buffer = filled(&[Timestamp::MAX - 1, Timestamp::MAX - 8]);
        assert_eq!(drained(&manager, &mut buffer), vec![Timestamp::MAX - 8, Timestamp::MAX - 1]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_configuration_roundtrip() {
        let (manager, _clock) = manager_at(0);
        assert_eq!(manager.get_configuration(), QosConfiguration::default());

        let random = QosConfiguration {
            mode: QosMode::RandomDegradation,
            distribution: Distribution::Constant,
            serialized_jitter_params: r#"{"delay":40}"#.into(),
            recording: None,
        };
        manager.set_configuration(&random).unwrap();
        assert_eq!(manager.mode(), QosMode::RandomDegradation);
        assert_eq!(manager.get_configuration(), random);

        let recorded = QosConfiguration {
            mode: QosMode::RecordedDegradation,
            recording: Some(Recording::new(20, vec![0, 10])),
            ..QosConfiguration::default()
        };
        manager.set_configuration(&recorded).unwrap();
        assert_eq!(manager.get_configuration(), recorded);
    }

    #[test]
    fn test_bad_configuration_keeps_strategy() {
        let (manager, _clock) = manager_at(0);
        let bad = QosConfiguration {
            mode: QosMode::RandomDegradation,
            distribution: Distribution::Poisson,
            serialized_jitter_params: r#"{"lambda":-1.0,"bufferSize":4}"#.into(),
            recording: None,
        };
        assert!(matches!(manager.set_configuration(&bad), Err(QosError::InvalidLambda(_))));

        let missing = QosConfiguration {
            mode: QosMode::RandomDegradation,
            ..QosConfiguration::default()
        };
        assert!(matches!(
            manager.set_configuration(&missing),
            Err(QosError::UnknownDistribution(_))
        ));
        assert_eq!(manager.mode(), QosMode::NotDegraded);
    }

    #[test]
    fn test_configuration_json_field_names() {
        let config = QosConfiguration {
            mode: QosMode::RandomDegradation,
            distribution: Distribution::Poisson,
            serialized_jitter_params: r#"{"lambda":1.2,"bufferSize":20}"#.into(),
            recording: None,
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""mode":"RandomDegradation""#));
        assert!(json.contains(r#""serializedJitterParams""#));
        let back: QosConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let minimal: QosConfiguration = serde_json::from_str(r#"{"mode":"NotDegraded"}"#).unwrap();
        assert_eq!(minimal, QosConfiguration::default());
    }

    #[test]
    fn test_recorded_mode_and_reset() {
        let (manager, clock) = manager_at(1_000);
        manager.set_recorded_degradation(Recording::new(20, vec![0, 10]));
        manager.reset_recording();

        // Relative to origin 1000: 1000 -> slot 0, 1020 -> slot 1 (+10).
        let mut buffer = filled(&[1_000, 1_020]);
        assert_eq!(drained(&manager, &mut buffer), vec![1_000]);
        clock.advance(29);
        assert!(drained(&manager, &mut buffer).is_empty());
        clock.advance(1);
        assert_eq!(drained(&manager, &mut buffer), vec![1_020]);
    }

    #[test]
    fn test_switching_away_from_recorded_flushes_degraded() {
        let (manager, clock) = manager_at(0);
        manager.set_recorded_degradation(Recording::new(20, vec![50]));
        let mut buffer = filled(&[0]);
        assert!(drained(&manager, &mut buffer).is_empty());

        manager.set_no_degradation();
        clock.advance(50);
        assert_eq!(drained(&manager, &mut buffer), vec![0]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_shared_manager_degrades_both_buffers() {
        let (manager, clock) = manager_at(0);
        let manager = Arc::new(manager);
        manager.set_random_degradation(JitterModel::Constant(ConstantDelay::new(20)));
        let mut position = filled(&[0]);
        let mut orientation = filled(&[0]);

        clock.advance(19);
        assert!(drained(&manager, &mut position).is_empty());
        assert!(drained(&manager, &mut orientation).is_empty());
        clock.advance(1);
        assert_eq!(drained(&manager, &mut position), vec![0]);
        assert_eq!(drained(&manager, &mut orientation), vec![0]);
    }

    proptest! {
        #[test]
        fn prop_immediate_preserves_order(stamps in prop::collection::vec(-500i32..500, 0..64), now in -500i32..500) {
            let clock = ManualClock::shared();
            clock.restart(now);
            let manager = QosManager::new(clock);
            let mut buffer = filled(&stamps);

            let out = drained(&manager, &mut buffer);
            let mut expected: Vec<Timestamp> = stamps.iter().copied().filter(|ts| *ts <= now).collect();
            expected.sort_unstable();
            expected.dedup();
            prop_assert_eq!(out, expected);
            prop_assert!(buffer.earliest().map_or(true, |ts| ts > now));
        }
    }
}
