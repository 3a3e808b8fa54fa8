//! Concrete scenario element kinds.

use crate::element::ScenarioElement;
use crate::error::WireError;
use crate::wire::{WireReader, WireWriter};
use serde::{Deserialize, Serialize};

/// Position and orientation, encoded as 3×f32 followed by a 4×f32 quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: [f32; 3],
    /// Quaternion `(x, y, z, w)`
    pub rotation: [f32; 4],
}

impl Pose {
    pub const ENCODED_SIZE: usize = 28;

    pub const IDENTITY: Pose = Pose {
        position: [0.0; 3],
        rotation: [0.0, 0.0, 0.0, 1.0],
    };

    pub fn at(x: f32, y: f32, z: f32) -> Self {
        Self {
            position: [x, y, z],
            ..Self::IDENTITY
        }
    }

    pub fn write(&self, out: &mut WireWriter) {
        for v in self.position.iter().chain(self.rotation.iter()) {
            out.put_f32(*v);
        }
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let mut pose = Self::IDENTITY;
        for v in pose.position.iter_mut().chain(pose.rotation.iter_mut()) {
            *v = reader.read_f32()?;
        }
        Ok(pose)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Pose of one tracked body part. Streamed every tick.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MoCapPose {
    pub body_id: u8,
    pub pose: Pose,
}

impl ScenarioElement for MoCapPose {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let mut reader = WireReader::new(payload);
        let body_id = reader.read_u8()?;
        self.pose = Pose::read(&mut reader)?;
        self.body_id = body_id;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        let mut out = WireWriter::with_capacity(1 + Pose::ENCODED_SIZE);
        out.put_u8(self.body_id);
        self.pose.write(&mut out);
        Some(out.into_bytes())
    }
}

/// Orientation of one tracked body part, without position. Streamed every tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoCapOrientation {
    pub body_id: u8,
    /// Quaternion `(x, y, z, w)`
    pub rotation: [f32; 4],
}

impl Default for MoCapOrientation {
    fn default() -> Self {
        Self {
            body_id: 0,
            rotation: Pose::IDENTITY.rotation,
        }
    }
}

impl ScenarioElement for MoCapOrientation {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let mut reader = WireReader::new(payload);
        let body_id = reader.read_u8()?;
        let mut rotation = [0.0; 4];
        for v in rotation.iter_mut() {
            *v = reader.read_f32()?;
        }
        self.body_id = body_id;
        self.rotation = rotation;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        let mut out = WireWriter::with_capacity(17);
        out.put_u8(self.body_id);
        for v in self.rotation {
            out.put_f32(v);
        }
        Some(out.into_bytes())
    }
}

/// A virtual object placed in the scenario. Sent only after it moves.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PhysicalObject {
    pose: Pose,
    modified: bool,
}

impl PhysicalObject {
    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        if pose != self.pose {
            self.modified = true;
        }
        self.pose = pose;
    }
}

impl ScenarioElement for PhysicalObject {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        self.pose = Pose::read(&mut WireReader::new(payload))?;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        if !std::mem::take(&mut self.modified) {
            return None;
        }
        let mut out = WireWriter::with_capacity(Pose::ENCODED_SIZE);
        self.pose.write(&mut out);
        Some(out.into_bytes())
    }
}

/// Vibration command for a haptic interface.
///
/// Amplitude 128 is rest. Sent when it changes and, so a receiver that missed
/// the change still converges, every `keepalive` ticks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HapticStimulus {
    amplitude: u8,
    modified: bool,
    keepalive: u32,
    since_sent: u32,
}

impl HapticStimulus {
    pub const REST: u8 = 128;
    pub const DEFAULT_KEEPALIVE: u32 = 50;

    pub fn with_keepalive(keepalive: u32) -> Self {
        Self {
            keepalive,
            ..Self::default()
        }
    }

    pub fn amplitude(&self) -> u8 {
        self.amplitude
    }

    pub fn is_active(&self) -> bool {
        self.amplitude != Self::REST
    }

    pub fn set_amplitude(&mut self, amplitude: u8) {
        if amplitude != self.amplitude {
            self.modified = true;
        }
        self.amplitude = amplitude;
    }

    pub fn stop(&mut self) {
        self.set_amplitude(Self::REST);
    }
}

impl Default for HapticStimulus {
    fn default() -> Self {
        Self {
            amplitude: Self::REST,
            modified: false,
            keepalive: Self::DEFAULT_KEEPALIVE,
            since_sent: 0,
        }
    }
}

impl ScenarioElement for HapticStimulus {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        self.amplitude = WireReader::new(payload).read_u8()?;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        self.since_sent += 1;
        let keepalive_due = self.keepalive > 0 && self.since_sent >= self.keepalive;
        if !self.modified && !keepalive_due {
            return None;
        }
        self.modified = false;
        self.since_sent = 0;
        Some(vec![self.amplitude])
    }
}

/// A positioned sound source. Sent when it moves or starts or stops playing.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AcousticStimulus {
    pose: Pose,
    playing: bool,
    modified: bool,
}

impl AcousticStimulus {
    pub fn pose(&self) -> Pose {
        self.pose
    }

    pub fn set_pose(&mut self, pose: Pose) {
        if pose != self.pose {
            self.modified = true;
        }
        self.pose = pose;
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn set_playing(&mut self, playing: bool) {
        if playing != self.playing {
            self.modified = true;
        }
        self.playing = playing;
    }
}

impl ScenarioElement for AcousticStimulus {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let mut reader = WireReader::new(payload);
        let pose = Pose::read(&mut reader)?;
        self.playing = reader.read_u8()? != 0;
        self.pose = pose;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        if !std::mem::take(&mut self.modified) {
            return None;
        }
        let mut out = WireWriter::with_capacity(Pose::ENCODED_SIZE + 1);
        self.pose.write(&mut out);
        out.put_u8(u8::from(self.playing));
        Some(out.into_bytes())
    }
}

/// Raw readings of a two-channel heart rate sensor. Streamed every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartRateSensor {
    pub raw_measurement_1: u32,
    pub raw_measurement_2: u32,
}

impl ScenarioElement for HeartRateSensor {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        let mut reader = WireReader::new(payload);
        let first = reader.read_u32()?;
        self.raw_measurement_2 = reader.read_u32()?;
        self.raw_measurement_1 = first;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        let mut out = WireWriter::with_capacity(8);
        out.put_u32(self.raw_measurement_1).put_u32(self.raw_measurement_2);
        Some(out.into_bytes())
    }
}

/// Raw time-of-flight reading of a proximity sensor. Streamed every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProximitySensor {
    pub raw_distance: u64,
}

impl ProximitySensor {
    /// Rough calibration from raw counts to metres.
    pub fn distance_m(&self) -> f32 {
        self.raw_distance as f32 / 56.2
    }
}

impl ScenarioElement for ProximitySensor {
    fn apply(&mut self, payload: &[u8]) -> Result<(), WireError> {
        self.raw_distance = WireReader::new(payload).read_u64()?;
        Ok(())
    }

    fn produce_update_if_changed(&mut self) -> Option<Vec<u8>> {
        Some(self.raw_distance.to_le_bytes().to_vec())
    }
}
