//! Error type of the simulation harness.

use thiserror::Error;
use vsnet_core::{QosError, SessionError};
use vsnet_env::EnvError;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid {name}: {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    #[error("Environment: {0}")]
    Env(#[from] EnvError),

    #[error("Session: {0}")]
    Session(#[from] SessionError),

    #[error("QoS: {0}")]
    Qos(#[from] QosError),
}

impl SimError {
    pub fn invalid(name: &'static str, value: f64) -> Self {
        Self::InvalidParameter { name, value }
    }
}
