/// Frozen (inference-mode) batch normalization.
///
/// Running statistics come from pretraining and are never updated here, so
/// per channel the transform is affine: `y = scale * x + shift` with
/// `scale = gamma / sqrt(var + eps)`. Its Jacobian is diagonal and constant,
/// which reduces the BN backward step to one scalar per channel.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Affine parameters and running statistics, one entry per channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchNormParams {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub running_mean: Vec<f32>,
    pub running_var: Vec<f32>,
    pub eps: f32,
}

impl BatchNormParams {
    /// Bind pretrained statistics. All four vectors must have `channels` entries.
    pub fn pretrained(
        gamma: Vec<f32>,
        beta: Vec<f32>,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
        eps: f32,
    ) -> Result<Self, ConfigError> {
        let bn = BatchNormParams { gamma, beta, running_mean, running_var, eps };
        bn.check()?;
        Ok(bn)
    }

    /// Channel counts agree and every channel has a finite, positive `var + eps`.
    pub fn check(&self) -> Result<(), ConfigError> {
        let channels = self.gamma.len();
        if channels == 0 {
            return Err(ConfigError::ZeroDimension { what: "batch-norm channels" });
        }
        for (what, v) in [
            ("batch-norm beta", &self.beta),
            ("batch-norm running_mean", &self.running_mean),
            ("batch-norm running_var", &self.running_var),
        ] {
            if v.len() != channels {
                return Err(ConfigError::LengthMismatch { what, expected: channels, found: v.len() });
            }
        }
        if !(self.eps >= 0.0 && self.eps.is_finite()) {
            return Err(ConfigError::InvalidHyperparameter { what: "batch-norm eps", value: self.eps });
        }
        for (channel, &value) in self.running_var.iter().enumerate() {
            if value < 0.0 {
                return Err(ConfigError::NegativeVariance { channel, value });
            }
            let denom = value + self.eps;
            if !(denom > 0.0 && denom.is_finite()) {
                return Err(ConfigError::DegenerateVariance { channel, value: denom });
            }
        }
        Ok(())
    }

    /// Identity transform (gamma=1, beta=0, mean=0, var=1) up to `eps`.
    pub fn identity(channels: usize) -> Self {
        BatchNormParams {
            gamma: vec![1.0; channels],
            beta: vec![0.0; channels],
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
            eps: 1e-5,
        }
    }

    pub fn channels(&self) -> usize {
        self.gamma.len()
    }

    /// Output of channel `c` for input `x`.
    #[inline]
    pub fn apply(&self, c: usize, x: f32) -> f32 {
        self.gamma[c] * (x - self.running_mean[c]) / (self.running_var[c] + self.eps).sqrt() + self.beta[c]
    }
}

/// In-place frozen BN over a `[channels, len]` map.
pub fn bn_inference_forward(bn: &BatchNormParams, x: &mut [f32], len: usize) {
    debug_assert_eq!(x.len(), bn.channels() * len);
    for c in 0..bn.channels() {
        for v in x[c * len..(c + 1) * len].iter_mut() {
            *v = bn.apply(c, *v);
        }
    }
}

/// dy/dx of frozen BN for channel `c`: the constant `gamma / sqrt(var + eps)`.
#[inline]
pub fn dydx_bn_frozen(bn: &BatchNormParams, c: usize) -> f32 {
    bn.gamma[c] / (bn.running_var[c] + bn.eps).sqrt()
}
