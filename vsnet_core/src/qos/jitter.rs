//! Statistical jitter models for random degradation.

use crate::element::PendingBuffer;
use crate::error::QosError;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vsnet_env::{is_due, Timestamp};

/// Which jitter model a configuration refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Distribution {
    #[default]
    None,
    Constant,
    Poisson,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Constant => "constant",
            Self::Poisson => "poisson",
        };
        f.write_str(name)
    }
}

impl FromStr for Distribution {
    type Err = QosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "constant" => Ok(Self::Constant),
            "poisson" => Ok(Self::Poisson),
            other => Err(QosError::UnknownDistribution(other.to_string())),
        }
    }
}

/// Parameters of [`ConstantDelay`], serialized as `{"delay":N}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstantParams {
    /// Added delay in milliseconds
    pub delay: Timestamp,
}

/// Parameters of [`PoissonJitter`], serialized as `{"lambda":x,"bufferSize":n}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoissonParams {
    pub lambda: f64,
    /// Size of the distribution table, i.e. the most updates released per tick
    pub buffer_size: usize,
    /// Fixed RNG seed for reproducible runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl PoissonParams {
    pub const DEFAULT_LAMBDA: f64 = 1.2;
    pub const DEFAULT_BUFFER_SIZE: usize = 20;
}

impl Default for PoissonParams {
    fn default() -> Self {
        Self {
            lambda: Self::DEFAULT_LAMBDA,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            seed: None,
        }
    }
}

/// Releases every update stamped at or before `now - delay`.
#[derive(Debug, Clone)]
pub struct ConstantDelay {
    params: ConstantParams,
}

impl ConstantDelay {
    pub fn new(delay: Timestamp) -> Self {
        Self {
            params: ConstantParams { delay },
        }
    }

    pub fn delay(&self) -> Timestamp {
        self.params.delay
    }

    fn drain(
        &self,
        buffer: &mut PendingBuffer,
        now: Timestamp,
        apply: &mut dyn FnMut(Timestamp, Vec<u8>),
    ) -> usize {
        let cutoff = now.wrapping_sub(self.params.delay);
        let mut applied = 0;
        while buffer.earliest().is_some_and(|ts| is_due(ts, cutoff)) {
            let Some((ts, payload)) = buffer.pop_incoming() else {
                break;
            };
            apply(ts, payload);
            applied += 1;
        }
        applied
    }
}

/// Releases a Poisson-distributed number of ready updates per tick.
///
/// The cumulative table has `buffer_size` slots: slot `k` holds
/// `P(X <= k)` and the last slot is forced to 1, so one uniform draw always
/// maps to some `k < buffer_size`.
#[derive(Debug, Clone)]
pub struct PoissonJitter {
    params: PoissonParams,
    cdf: Vec<f64>,
    rng: ChaCha8Rng,
}

impl PoissonJitter {
    pub fn new(params: PoissonParams) -> Result<Self, QosError> {
        let cdf = build_cdf(params.lambda, params.buffer_size)?;
        let rng = match params.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self { params, cdf, rng })
    }

    pub fn params(&self) -> PoissonParams {
        self.params
    }

    pub fn cdf(&self) -> &[f64] {
        &self.cdf
    }

    /// Changes lambda and rebuilds the table. The old table stays on error.
    pub fn set_lambda(&mut self, lambda: f64) -> Result<(), QosError> {
        self.cdf = build_cdf(lambda, self.params.buffer_size)?;
        self.params.lambda = lambda;
        Ok(())
    }

    /// Draws one value from the distribution.
    pub fn sample(&mut self) -> usize {
        let u: f64 = self.rng.gen();
        self.cdf
            .iter()
            .position(|&p| p >= u)
            .unwrap_or(self.cdf.len() - 1)
    }

    fn drain(
        &mut self,
        buffer: &mut PendingBuffer,
        now: Timestamp,
        apply: &mut dyn FnMut(Timestamp, Vec<u8>),
    ) -> usize {
        let ready = buffer.ready_count(now);
        if ready == 0 {
            return 0;
        }
        let count = self.sample().min(ready);
        let mut applied = 0;
        while applied < count && buffer.earliest().is_some_and(|ts| is_due(ts, now)) {
            let Some((ts, payload)) = buffer.pop_incoming() else {
                break;
            };
            apply(ts, payload);
            applied += 1;
        }
        applied
    }
}

fn build_cdf(lambda: f64, size: usize) -> Result<Vec<f64>, QosError> {
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(QosError::InvalidLambda(lambda));
    }
    if size == 0 {
        return Err(QosError::InvalidBufferCapacity(size));
    }
    let mut cdf = Vec::with_capacity(size);
    let mut pdf = (-lambda).exp();
    let mut acc = 0.0;
    for k in 0..size {
        if k > 0 {
            pdf *= lambda / k as f64;
        }
        acc += pdf;
        cdf.push(acc);
    }
    cdf[size - 1] = 1.0;
    Ok(cdf)
}

/// A configured statistical jitter model.
#[derive(Debug, Clone)]
pub enum JitterModel {
    Constant(ConstantDelay),
    Poisson(PoissonJitter),
}

impl JitterModel {
    /// Builds a model from its distribution tag and JSON parameters.
    ///
    /// An empty parameter string selects the defaults. `Distribution::None`
    /// has no model and yields `Ok(None)`.
    pub fn from_serialized(distribution: Distribution, json: &str) -> Result<Option<Self>, QosError> {
        let json = json.trim();
        let model = match distribution {
            Distribution::None => return Ok(None),
            Distribution::Constant => {
                let params: ConstantParams = if json.is_empty() {
                    ConstantParams::default()
                } else {
                    serde_json::from_str(json)?
                };
                Self::Constant(ConstantDelay { params })
            }
            Distribution::Poisson => {
                let params: PoissonParams = if json.is_empty() {
                    PoissonParams::default()
                } else {
                    serde_json::from_str(json)?
                };
                Self::Poisson(PoissonJitter::new(params)?)
            }
        };
        Ok(Some(model))
    }

    pub fn distribution(&self) -> Distribution {
        match self {
            Self::Constant(_) => Distribution::Constant,
            Self::Poisson(_) => Distribution::Poisson,
        }
    }

    /// JSON form of the model's parameters.
    pub fn serialized(&self) -> String {
        // Flat structs of numbers; serde_json cannot fail on them.
        let json = match self {
            Self::Constant(model) => serde_json::to_string(&model.params),
            Self::Poisson(model) => serde_json::to_string(&model.params),
        };
        json.unwrap_or_default()
    }

    pub(crate) fn drain(
        &mut self,
        buffer: &mut PendingBuffer,
        now: Timestamp,
        apply: &mut dyn FnMut(Timestamp, Vec<u8>),
    ) -> usize {
        match self {
            Self::Constant(model) => model.drain(buffer, now, apply),
            Self::Poisson(model) => model.drain(buffer, now, apply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn filled(stamps: &[Timestamp]) -> PendingBuffer {
        let mut buffer = PendingBuffer::default();
        for ts in stamps {
            buffer.push(*ts, ts.to_le_bytes().to_vec());
        }
        buffer
    }

    #[test]
    fn test_cdf_shape() {
        let model = PoissonJitter::new(PoissonParams::default()).unwrap();
        let cdf = model.cdf();
        assert_eq!(cdf.len(), 20);
        assert_relative_eq!(cdf[0], (-1.2f64).exp(), epsilon = 1e-12);
        assert_relative_eq!(cdf[1], (-1.2f64).exp() * 2.2, epsilon = 1e-12);
        assert_eq!(cdf[19], 1.0);
        assert!(cdf.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_invalid_parameters() {
        let bad = |lambda, buffer_size| {
            PoissonJitter::new(PoissonParams {
                lambda,
                buffer_size,
                seed: None,
            })
        };
        assert!(matches!(bad(-0.1, 20), Err(QosError::InvalidLambda(_))));
        assert!(matches!(bad(f64::NAN, 20), Err(QosError::InvalidLambda(_))));
        assert!(matches!(bad(1.0, 0), Err(QosError::InvalidBufferCapacity(0))));

        let mut model = bad(1.0, 5).unwrap();
        assert!(model.set_lambda(f64::INFINITY).is_err());
        assert_relative_eq!(model.params().lambda, 1.0);
        model.set_lambda(3.0).unwrap();
        assert_relative_eq!(model.params().lambda, 3.0);
    }

    #[test]
    fn test_zero_lambda_never_releases() {
        let mut model = PoissonJitter::new(PoissonParams {
            lambda: 0.0,
            buffer_size: 4,
            seed: Some(1),
        })
        .unwrap();
        let mut buffer = filled(&[1, 2, 3]);
        for _ in 0..50 {
            assert_eq!(model.drain(&mut buffer, 10, &mut |_, _| {}), 0);
        }
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_seeded_poisson_is_reproducible() {
        let params = PoissonParams {
            seed: Some(7),
            ..PoissonParams::default()
        };
        let mut a = PoissonJitter::new(params).unwrap();
        let mut b = PoissonJitter::new(params).unwrap();
        let draws_a: Vec<usize> = (0..100).map(|_| a.sample()).collect();
        let draws_b: Vec<usize> = (0..100).map(|_| b.sample()).collect();
        assert_eq!(draws_a, draws_b);

        let mean = draws_a.iter().sum::<usize>() as f64 / draws_a.len() as f64;
        assert!((0.6..2.0).contains(&mean));
    }

    #[test]
    fn test_constant_delay() {
        let model = ConstantDelay::new(50);
        let mut buffer = filled(&[100, 120, 160]);
        let mut seen = Vec::new();
        assert_eq!(model.drain(&mut buffer, 149, &mut |ts, _| seen.push(ts)), 0);
        assert_eq!(model.drain(&mut buffer, 170, &mut |ts, _| seen.push(ts)), 2);
        assert_eq!(seen, vec![100, 120]);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_constant_delay_across_clock_wrap() {
        let model = ConstantDelay::new(20);
        let mut buffer = filled(&[Timestamp::MAX - 30, Timestamp::MAX - 1]);
        let mut seen = Vec::new();
        assert_eq!(model.drain(&mut buffer, Timestamp::MIN + 20, &mut |ts, _| seen.push(ts)), 2);
        assert_eq!(seen, vec![Timestamp::MAX - 30, Timestamp::MAX - 1]);
        assert_eq!(buffer.ready_count(Timestamp::MIN), 0);
    }

    #[test]
    fn test_serialized_parameters() {
        let model = JitterModel::from_serialized(Distribution::Poisson, r#"{"lambda":2.5,"bufferSize":8}"#)
            .unwrap()
            .unwrap();
        assert_eq!(model.distribution(), Distribution::Poisson);
        assert_eq!(model.serialized(), r#"{"lambda":2.5,"bufferSize":8}"#);

        let constant = JitterModel::from_serialized(Distribution::Constant, "").unwrap().unwrap();
        assert_eq!(constant.serialized(), r#"{"delay":0}"#);

        assert!(JitterModel::from_serialized(Distribution::None, "").unwrap().is_none());
        assert!(JitterModel::from_serialized(Distribution::Constant, "{").is_err());
    }

    #[test]
    fn test_distribution_names() {
        assert_eq!("Poisson".parse::<Distribution>().unwrap(), Distribution::Poisson);
        assert_eq!(Distribution::Constant.to_string(), "constant");
        assert!("gauss".parse::<Distribution>().is_err());
    }

    proptest! {
        #[test]
        fn prop_poisson_never_exceeds_ready(
            stamps in prop::collection::btree_set(0i32..200, 0..40),
            now in 0i32..200,
            lambda in 0.0f64..15.0,
            seed in any::<u64>(),
        ) {
            let stamps: Vec<Timestamp> = stamps.into_iter().collect();
            let mut model = PoissonJitter::new(PoissonParams { lambda, buffer_size: 20, seed: Some(seed) }).unwrap();
            let mut buffer = filled(&stamps);
            let ready = buffer.ready_count(now);
            let mut released = Vec::new();
            let count = model.drain(&mut buffer, now, &mut |ts, _| released.push(ts));
            prop_assert!(count <= ready);
            prop_assert_eq!(count, released.len());
            prop_assert!(released.iter().all(|ts| *ts <= now));
            prop_assert!(released.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
