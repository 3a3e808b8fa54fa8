//! Pre-captured network delay traces replayed as degradation.

use crate::element::PendingBuffer;
use crate::error::QosError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::trace;
use vsnet_env::{is_due, Timestamp};

/// Cyclic delay trace: slot `i` covers `[i * period, (i + 1) * period)`
/// relative to the time origin.
///
/// A negative slot drops every update stamped inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    /// Slot width in milliseconds
    pub period: Timestamp,

    /// Added delay per slot, in milliseconds
    pub delay: Vec<Timestamp>,

    #[serde(skip)]
    time_origin: Timestamp,
}

impl Default for Recording {
    /// One zero slot: no delay and no loss.
    fn default() -> Self {
        Self::new(20, vec![0])
    }
}

impl Recording {
    pub fn new(period: Timestamp, delay: Vec<Timestamp>) -> Self {
        Self {
            period,
            delay,
            time_origin: 0,
        }
    }

    pub fn time_origin(&self) -> Timestamp {
        self.time_origin
    }

    pub fn set_time_origin(&mut self, origin: Timestamp) {
        self.time_origin = origin;
    }

    /// Delay for an update stamped `timestamp`. Negative means drop.
    ///
    /// Timestamps before the origin wrap backwards through the trace. An empty
    /// trace or a non-positive period adds no delay.
    pub fn get_delay(&self, timestamp: Timestamp) -> Timestamp {
        if self.delay.is_empty() || self.period <= 0 {
            return 0;
        }
        let relative = i64::from(timestamp) - i64::from(self.time_origin);
        let slot = relative.div_euclid(i64::from(self.period));
        let index = slot.rem_euclid(self.delay.len() as i64) as usize;
        self.delay[index]
    }

    /// The first `ms / period` slots, cycling through the trace.
    pub fn window(&self, ms: Timestamp) -> Vec<Timestamp> {
        if self.delay.is_empty() || self.period <= 0 || ms <= 0 {
            return Vec::new();
        }
        let length = (ms / self.period) as usize;
        self.delay.iter().copied().cycle().take(length).collect()
    }

    /// Fraction of slots that drop updates.
    pub fn loss_ratio(&self) -> f64 {
        if self.delay.is_empty() {
            return 0.0;
        }
        self.delay.iter().filter(|d| **d < 0).count() as f64 / self.delay.len() as f64
    }

    pub fn validate(&self) -> Result<(), QosError> {
        if self.period <= 0 {
            return Err(QosError::InvalidPeriod(self.period));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, QosError> {
        let recording: Self = serde_json::from_str(json)?;
        recording.validate()?;
        Ok(recording)
    }

    pub fn to_json(&self) -> Result<String, QosError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, QosError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| QosError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), QosError> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?).map_err(|source| QosError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Moves every incoming update into the degraded buffer at `t + delay(t)`,
    /// then releases degraded entries due at or before `now`.
    pub(crate) fn drain(
        &self,
        buffer: &mut PendingBuffer,
        now: Timestamp,
        apply: &mut dyn FnMut(Timestamp, Vec<u8>),
    ) -> usize {
        while let Some((ts, payload)) = buffer.pop_incoming() {
            let delay = self.get_delay(ts);
            if delay < 0 {
                trace!(ts, "update dropped by recorded loss");
                continue;
            }
            let due = ts.wrapping_add(delay);
            if buffer.degraded.contains_key(&due) {
                trace!(ts, due, "recorded delay collision, update dropped");
                continue;
            }
            buffer.degraded.insert(due, (ts, payload));
        }

        let mut applied = 0;
        while buffer
            .degraded
            .first_key_value()
            .is_some_and(|(due, _)| is_due(*due, now))
        {
            let Some((_, (ts, payload))) = buffer.degraded.pop_first() else {
                break;
            };
            apply(ts, payload);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(stamps: &[Timestamp]) -> PendingBuffer {
        let mut buffer = PendingBuffer::default();
        for ts in stamps {
            buffer.push(*ts, vec![]);
        }
        buffer
    }

    #[test]
    fn test_two_slot_trace() {
        let recording = Recording::new(20, vec![0, 10]);
        let due: Vec<Timestamp> = [0, 20, 40]
            .iter()
            .map(|ts| ts + recording.get_delay(*ts))
            .collect();
        assert_eq!(due, vec![0, 30, 40]);
    }

    #[test]
    fn test_slots_cycle_and_respect_origin() {
        let mut recording = Recording::new(20, vec![0, 5, 0, 10]);
        assert_eq!(recording.get_delay(19), 0);
        assert_eq!(recording.get_delay(20), 5);
        assert_eq!(recording.get_delay(79), 10);
        assert_eq!(recording.get_delay(80), 0);
        assert_eq!(recording.get_delay(-1), 10);

        recording.set_time_origin(1_000);
        assert_eq!(recording.get_delay(1_020), 5);
        assert_eq!(recording.get_delay(999), 10);
    }

    #[test]
    fn test_degenerate_traces_add_nothing() {
        assert_eq!(Recording::new(20, vec![]).get_delay(55), 0);
        assert_eq!(Recording::new(0, vec![30]).get_delay(55), 0);
        assert!(Recording::new(0, vec![30]).validate().is_err());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let recording = Recording::new(20, vec![0, 5, 0, 10]);
        let stamps: Vec<Timestamp> = (0..16).map(|i| i * 10).collect();

        let run = || {
            let mut buffer = filled(&stamps);
            let mut applied = Vec::new();
            for now in 0..200 {
                recording.drain(&mut buffer, now, &mut |ts, _| applied.push((ts, now)));
            }
            applied
        };
        let first = run();
        assert_eq!(first, run());
        // 70 + 10 and 80 + 0 land on the same slot; the later one is dropped.
        assert_eq!(first.len(), stamps.len() - 1);
        assert!(!first.iter().any(|(ts, _)| *ts == 80));
        assert!(first.contains(&(20, 25)));
        assert!(first.contains(&(60, 70)));
        assert!(first.contains(&(70, 80)));
    }

    #[test]
    fn test_loss_and_collision_drop_updates() {
        let recording = Recording::new(10, vec![-1, 0, 5]);
        // Slot 0 loses 0 and 30; 20 and 25 are pushed back by 5.
        let mut buffer = filled(&[0, 10, 20, 25, 30]);
        let mut applied = Vec::new();
        recording.drain(&mut buffer, 100, &mut |ts, _| applied.push(ts));
        assert_eq!(applied, vec![10, 20, 25]);

        let collide = Recording::new(10, vec![5, 0]);
        let mut buffer = filled(&[5, 10]);
        let mut applied = Vec::new();
        collide.drain(&mut buffer, 100, &mut |ts, _| applied.push(ts));
        assert_eq!(applied, vec![5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_window_cycles() {
        let recording = Recording::new(20, vec![1, 2, 3]);
        assert_eq!(recording.window(100), vec![1, 2, 3, 1, 2]);
        assert!(Recording::new(20, vec![]).window(100).is_empty());
        assert_eq!(Recording::new(10, vec![-1, 0]).loss_ratio(), 0.5);
    }

    #[test]
    fn test_json_format() {
        let recording = Recording::from_json(r#"{"period":20,"delay":[0,10]}"#).unwrap();
        assert_eq!(recording, Recording::new(20, vec![0, 10]));
        let json = recording.to_json().unwrap();
        assert!(!json.contains("time_origin"));
        assert!(Recording::from_json(r#"{"period":-5,"delay":[]}"#).is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("vsnet-recording-{}.json", std::process::id()));
        let recording = Recording::new(15, vec![0, -1, 40]);
        recording.save(&path).unwrap();
        assert_eq!(Recording::load(&path).unwrap(), recording);
        let _ = std::fs::remove_file(&path);
        assert!(matches!(Recording::load(&path), Err(QosError::Io { .. })));
    }
}
