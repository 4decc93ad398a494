/// Gradient verification.
///
/// Provides:
/// - `finite_diff_gradient`: central finite differences for one element
/// - `check_gradient`: sampled comparison of an analytic gradient against FD
/// - `conv_block_gradients`, `embedding_gradients`, `output_gradients`:
///   analytic gradients of one layer on a quadruple, for checking and tooling

use crate::backward::{
    conv_block_qoid_batch, embedding_qoid_batch, output_ce_batch, ConvBackwardScratch, LayerGrads,
};
use crate::error::EngineError;
use crate::model::{ConvBlock, DenseLayer};
use crate::qoid::QoidMetric;
use crate::tensor::{try_zeros, Quad};

/// Below this magnitude both gradients are within FD resolution at f32.
pub const FD_ABS_THRESHOLD: f32 = 5e-4;

/// Outcome of one `check_gradient` run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f32,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.passed == self.checked
    }
}

/// (loss(w + eps e_idx) - loss(w - eps e_idx)) / (2 eps)
pub fn finite_diff_gradient(
    params: &[f32],
    idx: usize,
    eps: f32,
    mut loss: impl FnMut(&[f32]) -> f32,
) -> f32 {
    let mut p = params.to_vec();
    p[idx] = params[idx] + eps;
    let plus = loss(&p);
    p[idx] = params[idx] - eps;
    let minus = loss(&p);
    (plus - minus) / (2.0 * eps)
}

/// Compare `analytic` against central differences of `loss` on up to
/// `num_samples` evenly spaced elements of `params`.
///
/// Uses relative error with denominator max(|a|, |n|). Elements where both
/// are below `FD_ABS_THRESHOLD` are auto-passed.
pub fn check_gradient(
    name: &str,
    params: &[f32],
    analytic: &[f32],
    num_samples: usize,
    eps: f32,
    tol: f32,
    mut loss: impl FnMut(&[f32]) -> f32,
) -> GradCheck {
    debug_assert_eq!(params.len(), analytic.len());
    let n = params.len();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let mut result = GradCheck { checked: 0, passed: 0, max_rel_err: 0.0 };

    for idx in (0..n).step_by(step).take(num_samples) {
        let a = analytic[idx];
        let numerical = finite_diff_gradient(params, idx, eps, &mut loss);
        let denom = a.abs().max(numerical.abs());
        result.checked += 1;
        if denom < FD_ABS_THRESHOLD {
            result.passed += 1;
            continue;
        }
        let rel_err = (a - numerical).abs() / denom;
        result.max_rel_err = result.max_rel_err.max(rel_err);
        if rel_err < tol {
            result.passed += 1;
        } else {
            tracing::debug!(tensor = name, idx, analytic = a, numerical, rel_err, "gradient check mismatch");
        }
    }
    result
}

/// Analytic QOID gradients of a conv block on a quadruple (dense engine).
pub fn conv_block_gradients(
    block: &ConvBlock,
    metric: QoidMetric,
    inputs: Quad<&[f32]>,
) -> Result<LayerGrads, EngineError> {
    let g = &block.geometry;
    let mut grads = LayerGrads::new(g.filters_len(), g.bias_len())?;
    let mut scratch = ConvBackwardScratch::new(g)?;
    conv_block_qoid_batch(block, metric, inputs, &mut grads, &mut scratch)?;
    Ok(grads)
}

/// Analytic QOID gradients of the embedding layer on a quadruple.
pub fn embedding_gradients(
    layer: &DenseLayer,
    metric: QoidMetric,
    inputs: Quad<&[f32]>,
) -> Result<LayerGrads, EngineError> {
    let mut grads = LayerGrads::new(layer.weights.len(), layer.bias.len())?;
    let mut dldy = try_zeros("embedding gradient", layer.out_size)?;
    embedding_qoid_batch(layer, metric, inputs, &mut grads, &mut dldy)?;
    Ok(grads)
}

/// Analytic cross-entropy gradients of the output layer on a quadruple.
pub fn output_gradients(
    layer: &DenseLayer,
    inputs: Quad<&[f32]>,
    labels: Quad<usize>,
) -> Result<LayerGrads, EngineError> {
    let mut grads = LayerGrads::new(layer.weights.len(), layer.bias.len())?;
    let mut dldz = try_zeros("output gradient", layer.out_size)?;
    output_ce_batch(layer, inputs, labels, &mut grads, &mut dldz)?;
    Ok(grads)
}
