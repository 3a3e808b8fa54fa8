//! Error types for the vsnet protocol engines.

use std::path::PathBuf;
use thiserror::Error;
use vsnet_env::EnvError;

/// Malformed or unexpected bytes on the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Payload too short: need {needed} bytes, got {got}")]
    Undersized { needed: usize, got: usize },

    #[error("Unknown command {0}")]
    UnknownCommand(u8),
}

/// Invalid QoS parameters or configuration.
#[derive(Debug, Error)]
pub enum QosError {
    #[error("Invalid lambda: {0} (must be finite and >= 0)")]
    InvalidLambda(f64),

    #[error("Invalid buffer capacity: {0}")]
    InvalidBufferCapacity(usize),

    #[error("Invalid recording period: {0} ms")]
    InvalidPeriod(i32),

    #[error("Unknown distribution: {0}")]
    UnknownDistribution(String),

    #[error("Jitter parameters: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Recording file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the scenario session and its channels.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Channel {0} already exists")]
    ChannelExists(u8),

    #[error("Element id space exhausted for this endpoint")]
    IdSpaceExhausted,

    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),
}

/// Errors loading or saving a session configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file {0} already exists")]
    Exists(PathBuf),
}
