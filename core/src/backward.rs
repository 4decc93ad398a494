/// Dense-intermediate backward passes for one sample at a time.
///
/// Conv block, right to left:
///   dL/dy (pooled, from the loss)
///   -> route to the pooled arg-max, mask by ReLU activity  (elementwise)
///   -> scale by the frozen-BN slope of the channel          (one scalar per filter)
///   -> dL/dw[wi] += <dL/dz, dy/dw column wi>                (column generated on demand)
///   -> dL/db     += sum of dL/dz over the positions each bias feeds
///
/// Gradients are accumulated, never overwritten: zero `LayerGrads` once per
/// batch, then call the per-sample function for each of the four samples.

use crate::batch_norm::dydx_bn_frozen;
use crate::conv1d::{dydw_column_conv1d, ConvGeometry};
use crate::dense::{accumulate_dense_grads, categorical_cross_entropy, dldz_softmax_cross_entropy};
use crate::error::EngineError;
use crate::forward::{conv_block_forward, embedding_forward, output_forward, ConvBlockCache, DenseCache};
use crate::model::{ConvBlock, DenseLayer};
use crate::pooling::{max_pool1d_backward, relu_grad};
use crate::qoid::{dldy_qoid, update_loss_qoid, QoidMetric, QoidState};
use crate::tensor::{dot, try_zeros, zero, Quad, QUAD};

/// Gradient accumulators for one layer's weight and bias tensors.
#[derive(Clone, Debug)]
pub struct LayerGrads {
    pub w: Vec<f32>,
    pub b: Vec<f32>,
}

impl LayerGrads {
    pub fn new(w_len: usize, b_len: usize) -> Result<Self, EngineError> {
        Ok(LayerGrads {
            w: try_zeros("weight gradients", w_len)?,
            b: try_zeros("bias gradients", b_len)?,
        })
    }

    pub fn zero(&mut self) {
        zero(&mut self.w);
        zero(&mut self.b);
    }
}

/// Reusable buffers for the conv-block backward pass, sized once per layer.
pub struct ConvBackwardScratch {
    dldy: Vec<f32>,
    dldz: Vec<f32>,
    col: Vec<f32>,
}

impl ConvBackwardScratch {
    pub fn new(g: &ConvGeometry) -> Result<Self, EngineError> {
        Ok(ConvBackwardScratch {
            dldy: try_zeros("pooled gradient", g.output_size())?,
            dldz: try_zeros("conv gradient", g.conv_size())?,
            col: try_zeros("dy/dw column", g.conv_size())?,
        })
    }
}

/// Accumulate dL/dw and dL/db of a conv block for one sample, given dL/dy at
/// the pooled output.
pub fn dldw_dldb_conv1d_block(
    block: &ConvBlock,
    x: &[f32],
    cache: &ConvBlockCache,
    dldy: &[f32],
    grads: &mut LayerGrads,
    dldz: &mut [f32],
    col: &mut [f32],
) {
    let g = &block.geometry;
    let conv_len = g.conv_len();
    debug_assert_eq!(dldy.len(), g.output_size());
    debug_assert_eq!(grads.w.len(), g.filters_len());
    debug_assert_eq!(grads.b.len(), g.bias_len());

    max_pool1d_backward(dldy, &cache.argmax, g.no_filters, conv_len, g.pool_size, dldz);
    for f in 0..g.no_filters {
        let scale = dydx_bn_frozen(&block.bn, f);
        for p in f * conv_len..(f + 1) * conv_len {
            dldz[p] *= relu_grad(cache.pre_activation[p]) * scale;
        }
    }

    for (wi, gw) in grads.w.iter_mut().enumerate() {
        let seg = dydw_column_conv1d(x, g, wi, col);
        *gw += dot(&col[seg.clone()], &dldz[seg]);
    }

    for f in 0..g.no_filters {
        let row = &dldz[f * conv_len..(f + 1) * conv_len];
        if g.bias_shared {
            grads.b[f] += row.iter().sum::<f32>();
        } else {
            for (gb, &d) in grads.b[g.bias_range(f)].iter_mut().zip(row.iter()) {
                *gb += d;
            }
        }
    }
}

/// QOID-driven conv-block backward for `sample`: dL/dy from the loss state,
/// then `dldw_dldb_conv1d_block`.
pub fn dldw_dldb_conv1d_block_qoid(
    block: &ConvBlock,
    state: &QoidState,
    outputs: Quad<&[f32]>,
    sample: usize,
    x: &[f32],
    cache: &ConvBlockCache,
    grads: &mut LayerGrads,
    scratch: &mut ConvBackwardScratch,
) {
    dldy_qoid(state, outputs, sample, &mut scratch.dldy);
    dldw_dldb_conv1d_block(block, x, cache, &scratch.dldy, grads, &mut scratch.dldz, &mut scratch.col);
}

/// Layer 4 backward for `sample`: QOID dL/dy -> ReLU mask -> dense weight/bias gradients.
pub fn dldw_dldb_embedding_qoid(
    state: &QoidState,
    outputs: Quad<&[f32]>,
    sample: usize,
    x: &[f32],
    cache: &DenseCache,
    grads: &mut LayerGrads,
    dldy: &mut [f32],
) {
    dldy_qoid(state, outputs, sample, dldy);
    for (d, &z) in dldy.iter_mut().zip(cache.pre_activation.iter()) {
        *d *= relu_grad(z);
    }
    accumulate_dense_grads(x, dldy, &mut grads.w, &mut grads.b);
}

/// Layer 5 backward for one sample with class `label`: softmax + cross-entropy.
pub fn dldw_dldb_output_ce(
    layer: &DenseLayer,
    x: &[f32],
    cache: &DenseCache,
    label: usize,
    grads: &mut LayerGrads,
    dldz: &mut [f32],
) {
    debug_assert_eq!(dldz.len(), layer.out_size);
    dldz_softmax_cross_entropy(&cache.output, label, dldz);
    accumulate_dense_grads(x, dldz, &mut grads.w, &mut grads.b);
}

/// One training batch of a conv block: forward the quadruple, compute the
/// QOID state of its pooled outputs and accumulate the gradients of all four
/// samples into `grads`.
pub fn conv_block_qoid_batch(
    block: &ConvBlock,
    metric: QoidMetric,
    inputs: Quad<&[f32]>,
    grads: &mut LayerGrads,
    scratch: &mut ConvBackwardScratch,
) -> Result<QoidState, EngineError> {
    let caches = [
        conv_block_forward(block, inputs[0])?,
        conv_block_forward(block, inputs[1])?,
        conv_block_forward(block, inputs[2])?,
        conv_block_forward(block, inputs[3])?,
    ];
    let outputs = [&caches[0].pooled[..], &caches[1].pooled[..], &caches[2].pooled[..], &caches[3].pooled[..]];
    let state = update_loss_qoid(metric, outputs);
    for s in 0..QUAD {
        dldw_dldb_conv1d_block_qoid(block, &state, outputs, s, inputs[s], &caches[s], grads, scratch);
    }
    Ok(state)
}

/// One training batch of the embedding layer.
pub fn embedding_qoid_batch(
    layer: &DenseLayer,
    metric: QoidMetric,
    inputs: Quad<&[f32]>,
    grads: &mut LayerGrads,
    dldy: &mut [f32],
) -> Result<QoidState, EngineError> {
    let caches = [
        embedding_forward(layer, inputs[0])?,
        embedding_forward(layer, inputs[1])?,
        embedding_forward(layer, inputs[2])?,
        embedding_forward(layer, inputs[3])?,
    ];
    let outputs = [&caches[0].output[..], &caches[1].output[..], &caches[2].output[..], &caches[3].output[..]];
    let state = update_loss_qoid(metric, outputs);
    for s in 0..QUAD {
        dldw_dldb_embedding_qoid(&state, outputs, s, inputs[s], &caches[s], grads, dldy);
    }
    Ok(state)
}

/// One training batch of the output layer. Returns the summed cross-entropy.
pub fn output_ce_batch(
    layer: &DenseLayer,
    inputs: Quad<&[f32]>,
    labels: Quad<usize>,
    grads: &mut LayerGrads,
    dldz: &mut [f32],
) -> Result<f32, EngineError> {
    let mut loss = 0.0;
    for s in 0..QUAD {
        let cache = output_forward(layer, inputs[s])?;
        loss += categorical_cross_entropy(&cache.output, labels[s]);
        dldw_dldb_output_ce(layer, inputs[s], &cache, labels[s], grads, dldz);
    }
    Ok(loss)
}
