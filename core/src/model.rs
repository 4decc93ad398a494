/// Network configuration and parameters.
///
/// SeizDetCNN layout, layer indices as used by the configuration entry points:
///   1..=3  Conv1D -> frozen BatchNorm -> ReLU -> MaxPool1D
///   4      fully connected -> ReLU        (embedding, trained on QOID)
///   5      fully connected -> softmax     (2 classes, trained on cross-entropy)
///
/// Each `set_*` call validates its dimensions against the previously
/// configured layer and leaves the parameters untouched on failure.
/// All weight tensors are flat Vec<f32>; see `conv1d` for the conv layout.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batch_norm::BatchNormParams;
use crate::conv1d::ConvGeometry;
use crate::error::{ConfigError, EngineError};
use crate::tensor::SimpleRng;

pub const FIRST_CONV_LAYER: usize = 1;
pub const LAST_CONV_LAYER: usize = 3;
pub const EMBEDDING_LAYER: usize = 4;
pub const OUTPUT_LAYER: usize = 5;
pub const NUM_LAYERS: usize = 5;

/// Output classes of layer 5.
pub const NUM_CLASSES: usize = 2;

/// Raw input shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParams {
    pub input_len: usize,
    pub input_depth: usize,
    /// Z-score each raw sample before layer 1.
    pub normalize: bool,
}

/// Hyperparameters of one conv block; input shape is derived from the previous layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConvBlockSpec {
    pub no_filters: usize,
    pub filter_len: usize,
    pub padding: usize,
    pub bias_shared: bool,
    pub pool_size: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvBlock {
    pub geometry: ConvGeometry,
    /// [no_filters, in_depth, filter_len]
    pub filters: Vec<f32>,
    /// [no_filters] or [no_filters, conv_len]
    pub bias: Vec<f32>,
    pub bn: BatchNormParams,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub in_size: usize,
    pub out_size: usize,
    /// [out_size, in_size]
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// All trainable tensors and frozen statistics of the network.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkParameters {
    pub input: Option<InputParams>,
    pub conv: [Option<ConvBlock>; 3],
    pub dense: [Option<DenseLayer>; 2],
}

fn nonzero(what: &'static str, v: usize) -> Result<(), ConfigError> {
    if v == 0 {
        Err(ConfigError::ZeroDimension { what })
    } else {
        Ok(())
    }
}

fn expect_len(what: &'static str, expected: usize, found: usize) -> Result<(), ConfigError> {
    if expected != found {
        Err(ConfigError::LengthMismatch { what, expected, found })
    } else {
        Ok(())
    }
}

impl ConvBlock {
    /// Shape of every tensor against the geometry, plus the BN statistics.
    pub fn check(&self, layer: usize) -> Result<(), ConfigError> {
        let g = &self.geometry;
        nonzero("in_len", g.in_len)?;
        nonzero("in_depth", g.in_depth)?;
        nonzero("no_filters", g.no_filters)?;
        nonzero("filter_len", g.filter_len)?;
        nonzero("pool_size", g.pool_size)?;
        if g.pooled_len() == 0 {
            return Err(ConfigError::EmptyOutput { layer, conv_len: g.conv_len(), pool_size: g.pool_size });
        }
        expect_len("conv filters", g.filters_len(), self.filters.len())?;
        expect_len("conv bias", g.bias_len(), self.bias.len())?;
        expect_len("batch-norm channels", g.no_filters, self.bn.channels())?;
        self.bn.check()
    }
}

impl DenseLayer {
    pub fn check(&self, layer: usize) -> Result<(), ConfigError> {
        nonzero("dense in_size", self.in_size)?;
        nonzero("dense out_size", self.out_size)?;
        if layer == OUTPUT_LAYER {
            expect_len("output classes", NUM_CLASSES, self.out_size)?;
        }
        expect_len("dense weights", self.in_size * self.out_size, self.weights.len())?;
        expect_len("dense bias", self.out_size, self.bias.len())
    }
}

impl NetworkParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_input_params(&mut self, input_len: usize, input_depth: usize, normalize: bool) -> Result<(), ConfigError> {
        nonzero("input_len", input_len)?;
        nonzero("input_depth", input_depth)?;
        self.input = Some(InputParams { input_len, input_depth, normalize });
        Ok(())
    }

    /// Configure conv block `layer` (1..=3) with pretrained or initial tensors.
    pub fn set_conv_block(
        &mut self,
        layer: usize,
        spec: ConvBlockSpec,
        filters: Vec<f32>,
        bias: Vec<f32>,
        bn: BatchNormParams,
    ) -> Result<(), ConfigError> {
        if !(FIRST_CONV_LAYER..=LAST_CONV_LAYER).contains(&layer) {
            return Err(ConfigError::LayerOutOfRange { layer, min: FIRST_CONV_LAYER, max: LAST_CONV_LAYER });
        }
        nonzero("no_filters", spec.no_filters)?;
        nonzero("filter_len", spec.filter_len)?;
        nonzero("pool_size", spec.pool_size)?;

        let (in_len, in_depth) = self.conv_input_shape(layer)?;
        let geometry = ConvGeometry {
            in_len,
            in_depth,
            no_filters: spec.no_filters,
            filter_len: spec.filter_len,
            padding: spec.padding,
            bias_shared: spec.bias_shared,
            pool_size: spec.pool_size,
        };
        let block = ConvBlock { geometry, filters, bias, bn };
        block.check(layer)?;
        self.conv[layer - 1] = Some(block);
        Ok(())
    }

    /// Configure dense layer `layer` (4 or 5). Layer 5 must have `NUM_CLASSES` outputs.
    pub fn set_dense_layer(
        &mut self,
        layer: usize,
        in_size: usize,
        out_size: usize,
        weights: Vec<f32>,
        bias: Vec<f32>,
    ) -> Result<(), ConfigError> {
        if !(EMBEDDING_LAYER..=OUTPUT_LAYER).contains(&layer) {
            return Err(ConfigError::LayerOutOfRange { layer, min: EMBEDDING_LAYER, max: OUTPUT_LAYER });
        }
        nonzero("dense in_size", in_size)?;
        nonzero("dense out_size", out_size)?;

        let expected_in = self.layer_output_size(layer - 1)
            .ok_or(ConfigError::MissingPredecessor { layer, missing: layer - 1 })?;
        if in_size != expected_in {
            return Err(ConfigError::ChainMismatch { layer, what: "input size", expected: expected_in, found: in_size });
        }
        let dense = DenseLayer { in_size, out_size, weights, bias };
        dense.check(layer)?;
        self.dense[layer - EMBEDDING_LAYER] = Some(dense);
        Ok(())
    }

    /// (in_len, in_depth) a conv block at `layer` must accept.
    fn conv_input_shape(&self, layer: usize) -> Result<(usize, usize), ConfigError> {
        if layer == FIRST_CONV_LAYER {
            let input = self.input.ok_or(ConfigError::MissingPredecessor { layer, missing: 0 })?;
            Ok((input.input_len, input.input_depth))
        } else {
            let prev = self.conv[layer - 2]
                .as_ref()
                .ok_or(ConfigError::MissingPredecessor { layer, missing: layer - 1 })?;
            Ok((prev.geometry.pooled_len(), prev.geometry.no_filters))
        }
    }

    /// Flattened output size of `layer` (0 = raw input), if configured.
    pub fn layer_output_size(&self, layer: usize) -> Option<usize> {
        match layer {
            0 => self.input.map(|i| i.input_len * i.input_depth),
            FIRST_CONV_LAYER..=LAST_CONV_LAYER => self.conv[layer - 1].as_ref().map(|c| c.geometry.output_size()),
            EMBEDDING_LAYER..=OUTPUT_LAYER => self.dense[layer - EMBEDDING_LAYER].as_ref().map(|d| d.out_size),
            _ => None,
        }
    }

    /// Re-check the whole network: chaining between layers (which may have
    /// been reconfigured out of order) and every tensor's shape. This is the
    /// boundary check for deserialized parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let input = self.input.ok_or(ConfigError::Incomplete { layer: 0 })?;
        nonzero("input_len", input.input_len)?;
        nonzero("input_depth", input.input_depth)?;
        for layer in FIRST_CONV_LAYER..=LAST_CONV_LAYER {
            let block = self.conv[layer - 1].as_ref().ok_or(ConfigError::Incomplete { layer })?;
            let (in_len, in_depth) = self.conv_input_shape(layer)?;
            if block.geometry.in_len != in_len {
                return Err(ConfigError::ChainMismatch { layer, what: "input length", expected: in_len, found: block.geometry.in_len });
            }
            if block.geometry.in_depth != in_depth {
                return Err(ConfigError::ChainMismatch { layer, what: "input depth", expected: in_depth, found: block.geometry.in_depth });
            }
            block.check(layer)?;
        }
        for layer in EMBEDDING_LAYER..=OUTPUT_LAYER {
            let dense = self.dense[layer - EMBEDDING_LAYER].as_ref().ok_or(ConfigError::Incomplete { layer })?;
            let expected = self.layer_output_size(layer - 1).unwrap_or(0);
            if dense.in_size != expected {
                return Err(ConfigError::ChainMismatch { layer, what: "input size", expected, found: dense.in_size });
            }
            dense.check(layer)?;
        }
        Ok(())
    }

    pub fn input_params(&self) -> Result<InputParams, ConfigError> {
        self.input.ok_or(ConfigError::Incomplete { layer: 0 })
    }

    pub fn conv_block(&self, layer: usize) -> Result<&ConvBlock, ConfigError> {
        self.conv
            .get(layer.wrapping_sub(FIRST_CONV_LAYER))
            .and_then(|c| c.as_ref())
            .ok_or(ConfigError::Incomplete { layer })
    }

    pub fn conv_block_mut(&mut self, layer: usize) -> Result<&mut ConvBlock, ConfigError> {
        self.conv
            .get_mut(layer.wrapping_sub(FIRST_CONV_LAYER))
            .and_then(|c| c.as_mut())
            .ok_or(ConfigError::Incomplete { layer })
    }

    pub fn dense_layer(&self, layer: usize) -> Result<&DenseLayer, ConfigError> {
        self.dense
            .get(layer.wrapping_sub(EMBEDDING_LAYER))
            .and_then(|d| d.as_ref())
            .ok_or(ConfigError::Incomplete { layer })
    }

    pub fn dense_layer_mut(&mut self, layer: usize) -> Result<&mut DenseLayer, ConfigError> {
        self.dense
            .get_mut(layer.wrapping_sub(EMBEDDING_LAYER))
            .and_then(|d| d.as_mut())
            .ok_or(ConfigError::Incomplete { layer })
    }

    /// Total trainable scalars (filters, conv biases, dense weights and biases).
    pub fn num_params(&self) -> usize {
        let conv: usize = self.conv.iter().flatten().map(|c| c.filters.len() + c.bias.len()).sum();
        let dense: usize = self.dense.iter().flatten().map(|d| d.weights.len() + d.bias.len()).sum();
        conv + dense
    }

    /// Small deterministic network for tests and benchmarks.
    ///
    ///   input [1, 32] -> conv(4x5, pad 2, pool 2, shared bias)   -> [4, 16]
    ///                 -> conv(4x3, pad 1, pool 2, per-position)  -> [4, 8]
    ///                 -> conv(4x3, pad 1, pool 2, shared bias)   -> [4, 4]
    ///                 -> dense 16 -> 8 -> dense 8 -> 2
    pub fn test_network(seed: u64) -> Result<Self, ConfigError> {
        let mut rng = SimpleRng::new(seed);
        let mut net = NetworkParameters::new();
        let specs = [
            ConvBlockSpec { no_filters: 4, filter_len: 5, padding: 2, bias_shared: true, pool_size: 2 },
            ConvBlockSpec { no_filters: 4, filter_len: 3, padding: 1, bias_shared: false, pool_size: 2 },
            ConvBlockSpec { no_filters: 4, filter_len: 3, padding: 1, bias_shared: true, pool_size: 2 },
        ];
        net.set_input_params(32, 1, false)?;
        for (l, spec) in specs.iter().enumerate() {
            let layer = l + 1;
            let (in_len, in_depth) = net.conv_input_shape(layer)?;
            let g = ConvGeometry {
                in_len,
                in_depth,
                no_filters: spec.no_filters,
                filter_len: spec.filter_len,
                padding: spec.padding,
                bias_shared: spec.bias_shared,
                pool_size: spec.pool_size,
            };
            let scale = (1.0 / (in_depth * spec.filter_len) as f32).sqrt();
            let filters = rng.vec_uniform(g.filters_len(), scale);
            let bias = rng.vec_uniform(g.bias_len(), 0.05);
            let c = spec.no_filters;
            let bn = BatchNormParams {
                gamma: (0..c).map(|_| 1.0 + rng.uniform(0.2)).collect(),
                beta: (0..c).map(|_| 0.1 + rng.uniform(0.05)).collect(),
                running_mean: (0..c).map(|_| rng.uniform(0.05)).collect(),
                running_var: (0..c).map(|_| 1.0 + rng.uniform(0.3)).collect(),
                eps: 1e-5,
            };
            net.set_conv_block(layer, *spec, filters, bias, bn)?;
        }
        let flat = net
            .layer_output_size(LAST_CONV_LAYER)
            .ok_or(ConfigError::Incomplete { layer: LAST_CONV_LAYER })?;
        for (layer, out) in [(EMBEDDING_LAYER, 8), (OUTPUT_LAYER, NUM_CLASSES)] {
            let in_size = if layer == EMBEDDING_LAYER { flat } else { 8 };
            let scale = (1.0 / in_size as f32).sqrt();
            let weights = rng.vec_uniform(in_size * out, scale);
            let bias = rng.vec_uniform(out, 0.05);
            net.set_dense_layer(layer, in_size, out, weights, bias)?;
        }
        Ok(net)
    }
}

/// Write parameters as JSON.
pub fn save_checkpoint(path: &Path, params: &NetworkParameters) -> Result<(), EngineError> {
    let json = serde_json::to_string(params)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read parameters written by `save_checkpoint` and re-validate the whole network.
pub fn load_checkpoint(path: &Path) -> Result<NetworkParameters, EngineError> {
    let json = std::fs::read_to_string(path)?;
    let params: NetworkParameters = serde_json::from_str(&json)?;
    params.validate()?;
    Ok(params)
}
