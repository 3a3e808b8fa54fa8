//! Synthetic network traces for recorded degradation.

use crate::error::SimError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use vsnet_core::Recording;
use vsnet_env::Timestamp;

/// Builds a [`Recording`] whose slots follow `Normal(base, jitter)` delays,
/// with a fraction of slots marked as lost.
#[derive(Debug, Clone)]
pub struct TraceSynthesizer {
    period: Timestamp,
    base_latency_ms: f64,
    jitter_ms: f64,
    loss_rate: f64,
    seed: u64,
}

impl TraceSynthesizer {
    pub fn new(period: Timestamp, base_latency_ms: f64, jitter_ms: f64, loss_rate: f64) -> Result<Self, SimError> {
        if period <= 0 {
            return Err(SimError::invalid("period", f64::from(period)));
        }
        if !base_latency_ms.is_finite() || base_latency_ms < 0.0 {
            return Err(SimError::invalid("base latency", base_latency_ms));
        }
        if !jitter_ms.is_finite() || jitter_ms < 0.0 {
            return Err(SimError::invalid("jitter", jitter_ms));
        }
        if !(0.0..=1.0).contains(&loss_rate) {
            return Err(SimError::invalid("loss rate", loss_rate));
        }
        Ok(Self {
            period,
            base_latency_ms,
            jitter_ms,
            loss_rate,
            seed: 0,
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// A trace covering `duration_ms`, at least one slot long.
    pub fn synthesize(&self, duration_ms: Timestamp) -> Result<Recording, SimError> {
        let normal = Normal::new(self.base_latency_ms, self.jitter_ms)
            .map_err(|_| SimError::invalid("jitter", self.jitter_ms))?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let slots = (duration_ms / self.period).max(1);

        let delay = (0..slots)
            .map(|_| {
                if self.loss_rate > 0.0 && rng.gen_bool(self.loss_rate) {
                    -1
                } else {
                    normal.sample(&mut rng).round().max(0.0) as Timestamp
                }
            })
            .collect();
        Ok(Recording::new(self.period, delay))
    }
}
