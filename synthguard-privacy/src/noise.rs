use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseMechanism {
    Laplace,
    Gaussian,
}

/// Calibrated noise for one query. `scale` is the Laplace scale `b` or the
/// Gaussian standard deviation `sigma`, depending on `mechanism`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoiseParameters {
    pub mechanism: NoiseMechanism,
    pub scale: f64,
    pub sensitivity: f64,
    pub epsilon: f64,
    pub delta: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NoiseError {
    #[error("epsilon must be a positive finite number, got {0}")]
    InvalidEpsilon(f64),
    #[error("delta must be within [0, 1), got {0}")]
    InvalidDelta(f64),
    #[error("sensitivity must be a positive finite number, got {0}")]
    InvalidSensitivity(f64),
    #[error("the laplace mechanism is pure epsilon-DP and requires delta == 0, got {delta}")]
    InvalidMechanismForDelta { delta: f64 },
    #[error("the analytic gaussian bound needs epsilon in (0, 1) and delta > 0, got epsilon {epsilon}, delta {delta}")]
    EpsilonOutOfSupportedRange { epsilon: f64, delta: f64 },
}

/// Noise scale for a query with the given L1 (Laplace) or L2 (Gaussian)
/// sensitivity.
///
/// Laplace: `b = sensitivity / epsilon`, delta must be zero.
/// Gaussian: `sigma = sensitivity * sqrt(2 ln(1.25 / delta)) / epsilon`,
/// valid for `epsilon < 1` only.
pub fn calibrate(
    mechanism: NoiseMechanism,
    sensitivity: f64,
    epsilon: f64,
    delta: f64,
) -> Result<NoiseParameters, NoiseError> {
    if !(sensitivity.is_finite() && sensitivity > 0.0) {
        return Err(NoiseError::InvalidSensitivity(sensitivity));
    }
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(NoiseError::InvalidEpsilon(epsilon));
    }
    if !(0.0..1.0).contains(&delta) {
        return Err(NoiseError::InvalidDelta(delta));
    }
    let scale = match mechanism {
        NoiseMechanism::Laplace => {
            if delta != 0.0 {
                return Err(NoiseError::InvalidMechanismForDelta { delta });
            }
            sensitivity / epsilon
        }
        NoiseMechanism::Gaussian => {
            if epsilon >= 1.0 || delta == 0.0 {
                return Err(NoiseError::EpsilonOutOfSupportedRange { epsilon, delta });
            }
            sensitivity * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
        }
    };
    Ok(NoiseParameters {
        mechanism,
        scale,
        sensitivity,
        epsilon,
        delta,
    })
}

/// Deterministic noise source. Equal seeds give equal draws, which keeps
/// released statistics replay-stable.
pub struct NoiseSampler {
    rng: ChaCha20Rng,
}

impl NoiseSampler {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            rng: ChaCha20Rng::from_seed(seed),
        }
    }

    /// Seeds from the blake3 keyed hash of `material`, so the stream is
    /// reproducible only for holders of `key`.
    pub fn keyed(key: &[u8; 32], material: impl AsRef<[u8]>) -> Self {
        Self::from_seed(*blake3::keyed_hash(key, material.as_ref()).as_bytes())
    }

    pub fn sample(&mut self, params: &NoiseParameters) -> f64 {
        match params.mechanism {
            NoiseMechanism::Laplace => self.laplace(params.scale),
            NoiseMechanism::Gaussian => match Normal::new(0.0, params.scale) {
                Ok(normal) => normal.sample(&mut self.rng),
                // calibrate never yields a non-finite sigma
                Err(_) => 0.0,
            },
        }
    }

    pub fn perturb(&mut self, value: f64, params: &NoiseParameters) -> f64 {
        value + self.sample(params)
    }

    /// Inverse-CDF Laplace draw with location 0.
    fn laplace(&mut self, scale: f64) -> f64 {
        let u: f64 = self.rng.gen_range(-0.5..0.5);
        -scale * u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
    }
}

impl std::fmt::Debug for NoiseSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseSampler").finish_non_exhaustive()
    }
}
