/// Adam optimizer state for one trainable tensor.
///
///   m = b1*m + (1-b1)*g
///   u = b2*u + (1-b2)*g^2
///   w -= lr * (m / (1 - b1^t)) / (sqrt(u / (1 - b2^t)) + eps)
///
/// The running powers b1^t, b2^t start at b1, b2 and advance once per step,
/// not once per element. `update` is the elementwise kernel: the dense engine
/// calls it through `step`, the fused engine calls it per filter with
/// gradients it rescales on the fly, then calls `advance` once.

use serde::{Deserialize, Serialize};

/// Adam hyperparameters (shared by every tensor of a training run).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub lr: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            beta1: 0.9,
            beta2: 0.999,
            lr: 1e-3,
            eps: 1e-8,
        }
    }
}

/// First/second moment buffers plus bias-correction powers.
#[derive(Clone, Debug)]
pub struct AdamState {
    pub config: AdamConfig,
    m: Vec<f32>,
    u: Vec<f32>,
    beta1_t: f32,
    beta2_t: f32,
    steps: u32,
}

impl AdamState {
    pub fn new(n: usize, config: AdamConfig) -> Self {
        AdamState {
            config,
            m: vec![0.0; n],
            u: vec![0.0; n],
            beta1_t: config.beta1,
            beta2_t: config.beta2,
            steps: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Number of completed steps.
    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn first_moment(&self) -> &[f32] {
        &self.m
    }

    pub fn second_moment(&self) -> &[f32] {
        &self.u
    }

    /// Update element `i` of the tensor in place with gradient `g`.
    #[inline]
    pub fn update(&mut self, i: usize, w: &mut f32, g: f32) {
        let c = &self.config;
        self.m[i] = c.beta1 * self.m[i] + (1.0 - c.beta1) * g;
        self.u[i] = c.beta2 * self.u[i] + (1.0 - c.beta2) * g * g;
        let m_hat = self.m[i] / (1.0 - self.beta1_t);
        let u_hat = self.u[i] / (1.0 - self.beta2_t);
        *w -= c.lr * m_hat / (u_hat.sqrt() + c.eps);
    }

    /// Close the current step: advance the bias-correction powers.
    pub fn advance(&mut self) {
        self.beta1_t *= self.config.beta1;
        self.beta2_t *= self.config.beta2;
        self.steps += 1;
    }

    /// Full step on a dense gradient array.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        debug_assert_eq!(params.len(), self.len());
        debug_assert_eq!(grads.len(), self.len());
        for (i, (w, &g)) in params.iter_mut().zip(grads.iter()).enumerate() {
            self.update(i, w, g);
        }
        self.advance();
    }
}
