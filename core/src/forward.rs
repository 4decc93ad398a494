/// Per-layer forward passes with the intermediates the dense engine's
/// backward pass needs, plus whole-network inference.
///
/// Buffers are allocated through `try_zeros`, so a device that cannot hold a
/// layer's activation maps fails with `EngineError::Allocation` up front.

use crate::batch_norm::bn_inference_forward;
use crate::conv1d::conv1d;
use crate::dense::{categorical_cross_entropy, fully_connected, softmax};
use crate::error::{ConfigError, EngineError};
use crate::model::{
    ConvBlock, DenseLayer, InputParams, NetworkParameters, FIRST_CONV_LAYER, LAST_CONV_LAYER,
    EMBEDDING_LAYER, NUM_CLASSES, OUTPUT_LAYER,
};
use crate::normalization::normalize;
use crate::pooling::{max_pool1d, relu};
use crate::qoid::{update_loss_qoid, QoidMetric};
use crate::tensor::{try_filled, try_zeros, Quad};

/// Conv-block intermediates of one sample.
#[derive(Clone, Debug)]
pub struct ConvBlockCache {
    /// BN output before ReLU: [no_filters, conv_len]
    pub pre_activation: Vec<f32>,
    /// [no_filters, conv_len]
    pub post_relu: Vec<f32>,
    /// [no_filters, pooled_len]
    pub pooled: Vec<f32>,
    /// In-window arg-max of every pooled output.
    pub argmax: Vec<usize>,
}

/// Dense-layer intermediates of one sample.
#[derive(Clone, Debug)]
pub struct DenseCache {
    /// W x + b
    pub pre_activation: Vec<f32>,
    /// ReLU (layer 4) or softmax (layer 5) of `pre_activation`.
    pub output: Vec<f32>,
}

/// Conv1D -> frozen BN -> ReLU -> MaxPool1D for one sample.
pub fn conv_block_forward(block: &ConvBlock, x: &[f32]) -> Result<ConvBlockCache, EngineError> {
    let g = &block.geometry;
    if x.len() != g.input_size() {
        return Err(ConfigError::LengthMismatch { what: "conv block input", expected: g.input_size(), found: x.len() }.into());
    }

    let mut pre_activation = try_zeros("conv pre-activation", g.conv_size())?;
    conv1d(x, &block.filters, &block.bias, g, &mut pre_activation);
    bn_inference_forward(&block.bn, &mut pre_activation, g.conv_len());

    let mut post_relu = try_zeros("conv post-relu", g.conv_size())?;
    post_relu.copy_from_slice(&pre_activation);
    relu(&mut post_relu);

    let mut pooled = try_zeros("conv pooled", g.output_size())?;
    let mut argmax = try_filled("conv arg-max", g.output_size(), 0usize)?;
    max_pool1d(&post_relu, g.no_filters, g.conv_len(), g.pool_size, &mut pooled, &mut argmax);

    Ok(ConvBlockCache { pre_activation, post_relu, pooled, argmax })
}

fn dense_pre_activation(layer: &DenseLayer, x: &[f32]) -> Result<Vec<f32>, EngineError> {
    if x.len() != layer.in_size {
        return Err(ConfigError::LengthMismatch { what: "dense input", expected: layer.in_size, found: x.len() }.into());
    }
    let mut z = try_zeros("dense pre-activation", layer.out_size)?;
    fully_connected(x, &layer.weights, &layer.bias, layer.in_size, layer.out_size, &mut z);
    Ok(z)
}

/// Layer 4: fully connected -> ReLU.
pub fn embedding_forward(layer: &DenseLayer, x: &[f32]) -> Result<DenseCache, EngineError> {
    let pre_activation = dense_pre_activation(layer, x)?;
    let mut output = pre_activation.clone();
    relu(&mut output);
    Ok(DenseCache { pre_activation, output })
}

/// Layer 5: fully connected -> softmax.
pub fn output_forward(layer: &DenseLayer, x: &[f32]) -> Result<DenseCache, EngineError> {
    let pre_activation = dense_pre_activation(layer, x)?;
    let mut output = try_zeros("class probabilities", layer.out_size)?;
    softmax(&pre_activation, &mut output);
    Ok(DenseCache { pre_activation, output })
}

/// Check the raw sample shape and apply per-channel z-score if configured.
pub fn prepare_input(input: &InputParams, raw: &[f32]) -> Result<Vec<f32>, EngineError> {
    let expected = input.input_len * input.input_depth;
    if raw.len() != expected {
        return Err(ConfigError::LengthMismatch { what: "raw input", expected, found: raw.len() }.into());
    }
    let mut x = try_zeros("layer 1 input", expected)?;
    if input.normalize {
        let n = input.input_len;
        for d in 0..input.input_depth {
            normalize(&raw[d * n..(d + 1) * n], &mut x[d * n..(d + 1) * n]);
        }
    } else {
        x.copy_from_slice(raw);
    }
    Ok(x)
}

/// Class probabilities of one raw sample through the whole network.
pub fn infer(params: &NetworkParameters, raw: &[f32]) -> Result<[f32; NUM_CLASSES], EngineError> {
    params.validate()?;
    let mut x = prepare_input(&params.input_params()?, raw)?;
    for layer in FIRST_CONV_LAYER..=LAST_CONV_LAYER {
        x = conv_block_forward(params.conv_block(layer)?, &x)?.pooled;
    }
    x = embedding_forward(params.dense_layer(EMBEDDING_LAYER)?, &x)?.output;
    let probs = output_forward(params.dense_layer(OUTPUT_LAYER)?, &x)?.output;
    let mut out = [0.0f32; NUM_CLASSES];
    out.copy_from_slice(&probs);
    Ok(out)
}

/// Arg-max class of one raw sample (1 = positive).
pub fn classify(params: &NetworkParameters, raw: &[f32]) -> Result<usize, EngineError> {
    let p = infer(params, raw)?;
    Ok(if p[1] > p[0] { 1 } else { 0 })
}

/// QOID loss of a conv block's pooled outputs over a quadruple.
pub fn conv_block_qoid_loss(block: &ConvBlock, metric: QoidMetric, inputs: Quad<&[f32]>) -> Result<f32, EngineError> {
    let y = [
        conv_block_forward(block, inputs[0])?.pooled,
        conv_block_forward(block, inputs[1])?.pooled,
        conv_block_forward(block, inputs[2])?.pooled,
        conv_block_forward(block, inputs[3])?.pooled,
    ];
    Ok(update_loss_qoid(metric, [&y[0], &y[1], &y[2], &y[3]]).loss())
}

/// QOID loss of the embedding layer over a quadruple.
pub fn embedding_qoid_loss(layer: &DenseLayer, metric: QoidMetric, inputs: Quad<&[f32]>) -> Result<f32, EngineError> {
    let y = [
        embedding_forward(layer, inputs[0])?.output,
        embedding_forward(layer, inputs[1])?.output,
        embedding_forward(layer, inputs[2])?.output,
        embedding_forward(layer, inputs[3])?.output,
    ];
    Ok(update_loss_qoid(metric, [&y[0], &y[1], &y[2], &y[3]]).loss())
}

/// Cross-entropy of the output layer summed over a quadruple.
pub fn output_ce_loss(layer: &DenseLayer, inputs: Quad<&[f32]>, labels: Quad<usize>) -> Result<f32, EngineError> {
    let mut loss = 0.0;
    for (x, label) in inputs.iter().zip(labels) {
        loss += categorical_cross_entropy(&output_forward(layer, x)?.output, label);
    }
    Ok(loss)
}
