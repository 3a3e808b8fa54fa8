//! Persisted session configuration.
//!
//! ```json
//! {
//!   "init": { "deviceId": 6, "registryPort": 11000, "sessionPort": 11001, ... },
//!   "environment": "corridor",
//!   "detectionAreas": { "evas": [ { "sensorAnchorId": 2, "configuration": { ... } } ] },
//!   "mocapQos": { "mode": "NotDegraded" }
//! }
//! ```
//!
//! Detection-area configurations belong to the sensory-substitution
//! collaborators and are carried as opaque JSON.

use crate::error::ConfigError;
use crate::qos::QosConfiguration;
use crate::registry::RegistryConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Ports, channel numbers and identity of the local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitData {
    pub device_id: u8,
    pub registry_port: u16,
    pub session_port: u16,
    pub mocap_port: u16,
    pub pose_channel: u8,
    pub orientation_channel: u8,
    pub body_id: u8,
}

impl Default for InitData {
    fn default() -> Self {
        Self {
            device_id: 6,
            registry_port: 11000,
            session_port: 11001,
            mocap_port: 11002,
            pose_channel: 4,
            orientation_channel: 3,
            body_id: 1,
        }
    }
}

/// One sensor placement and the configuration of the algorithm attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionArea {
    pub sensor_anchor_id: i32,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub init: InitData,
    pub environment: String,
    /// Detection areas grouped by algorithm name
    pub detection_areas: BTreeMap<String, Vec<DetectionArea>>,
    pub mocap_qos: QosConfiguration,
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&json)?;
        info!(path = %path.display(), device = config.init.device_id, "session config loaded");
        Ok(config)
    }

    /// Writes the configuration as pretty JSON.
    ///
    /// # Errors
    /// `ConfigError::Exists` if `path` exists and `overwrite` is false.
    pub fn save(&self, path: impl AsRef<Path>, overwrite: bool) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if !overwrite && path.exists() {
            return Err(ConfigError::Exists(path.to_path_buf()));
        }
        fs::write(path, self.to_json()?).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Registry settings for this device, scanning the broadcast address.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::new(self.init.device_id, self.init.registry_port)
    }

    /// Detection areas of one algorithm, empty if none are configured.
    pub fn detection_areas(&self, algorithm: &str) -> &[DetectionArea] {
        self.detection_areas.get(algorithm).map_or(&[], Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::{Distribution, QosMode, Recording};
    use serde_json::json;

    fn sample() -> SessionConfig {
        let mut config = SessionConfig {
            environment: "corridor".into(),
            mocap_qos: QosConfiguration {
                mode: QosMode::RecordedDegradation,
                recording: Some(Recording::new(20, vec![0, 10, -1])),
                ..QosConfiguration::default()
            },
            ..SessionConfig::default()
        };
        config.detection_areas.insert(
            "evas".into(),
            vec![DetectionArea {
                sensor_anchor_id: 2,
                configuration: json!({"range": 3.5, "channels": [1, 2]}),
            }],
        );
        config
    }

    #[test]
    fn test_defaults() {
        let init = InitData::default();
        assert_eq!((init.registry_port, init.session_port, init.mocap_port), (11000, 11001, 11002));
        assert_eq!((init.pose_channel, init.orientation_channel), (4, 3));
        let registry = SessionConfig::default().registry_config();
        assert_eq!(registry.device_id, 6);
        assert_eq!(registry.broadcast_targets[0].port(), 11000);
    }

    #[test]
    fn test_json_shape() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"registryPort\""));
        assert!(json.contains("\"sensorAnchorId\""));
        assert!(json.contains("\"mocapQos\""));
        assert_eq!(SessionConfig::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SessionConfig::from_json(
            r#"{"init":{"deviceId":9},"mocapQos":{"mode":"RandomDegradation","distribution":"Constant"}}"#,
        )
        .unwrap();
        assert_eq!(config.init.device_id, 9);
        assert_eq!(config.init.session_port, 11001);
        assert_eq!(config.mocap_qos.distribution, Distribution::Constant);
        assert!(config.detection_areas("pvas").is_empty());
        assert!(SessionConfig::from_json("{").is_err());
    }

    #[test]
    fn test_save_respects_overwrite() {
        let path = std::env::temp_dir().join(format!("vsnet-session-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let config = sample();
        config.save(&path, false).unwrap();
        assert!(matches!(config.save(&path, false), Err(ConfigError::Exists(_))));
        config.save(&path, true).unwrap();

        let loaded = SessionConfig::load(&path).unwrap();
        assert_eq!(loaded.detection_areas("evas")[0].configuration["range"], 3.5);
        let _ = fs::remove_file(&path);
        assert!(matches!(SessionConfig::load(&path), Err(ConfigError::Io { .. })));
    }
}
