/// Greedy layer-wise training of the five-layer network on one quadruple.
///
/// Each layer runs the same cycle, driven by `TrainState`:
///
///   ForwardTrain -> ComputeLoss -> ZeroGradients -> BackwardAccumulate(0..4)
///     -> OptimizerStep -> (next epoch: ForwardTrain | ForwardInferenceFinal)
///
/// `ForwardInferenceFinal` recomputes the layer's outputs with the updated
/// weights; they become the next layer's inputs and the layer is never
/// revisited. Layers 1-4 train on QOID, layer 5 on cross-entropy.
///
/// Every buffer a layer needs (activation caches, packed records, gradient
/// accumulators, Adam moments) lives in that layer's `LayerSession` and is
/// dropped before the next layer's session is opened.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::adam::{AdamConfig, AdamState};
use crate::backward::{
    dldw_dldb_conv1d_block_qoid, dldw_dldb_embedding_qoid, dldw_dldb_output_ce, ConvBackwardScratch,
    LayerGrads,
};
use crate::dense::categorical_cross_entropy;
use crate::error::{ConfigError, EngineError};
use crate::forward::{
    conv_block_forward, embedding_forward, output_forward, prepare_input, ConvBlockCache, DenseCache,
};
use crate::fused::{
    adam_step_optimized, backward_optimized_conv1d_bn_relu_maxpool, forward_dldy_conv1d_bn_relu_maxpool_4,
    forward_output_conv1d_bn_relu_maxpool_4, PackedBackwardRecord, MAX_PACKED_POOL,
};
use crate::model::{
    ConvBlock, DenseLayer, NetworkParameters, EMBEDDING_LAYER, FIRST_CONV_LAYER, LAST_CONV_LAYER,
    NUM_CLASSES, NUM_LAYERS, OUTPUT_LAYER,
};
use crate::qoid::{update_loss_qoid, QoidMetric, QoidState};
use crate::tensor::{try_zeros, Quad, QUAD};

/// Class labels of the quadruple: two positives, then two negatives.
pub const QUAD_LABELS: Quad<usize> = [1, 1, 0, 0];

/// The four raw training samples.
#[derive(Clone, Debug, PartialEq)]
pub struct Quadruple {
    pub samples: Quad<Vec<f32>>,
}

impl Quadruple {
    pub fn new(positive: [Vec<f32>; 2], negative: [Vec<f32>; 2]) -> Self {
        let [p0, p1] = positive;
        let [n0, n1] = negative;
        Quadruple { samples: [p0, p1, n0, n1] }
    }

    pub fn refs(&self) -> Quad<&[f32]> {
        [&self.samples[0], &self.samples[1], &self.samples[2], &self.samples[3]]
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Conv-block training engine for layers 1-3.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvKernel {
    /// Keeps pre-activation and post-ReLU maps per sample.
    #[default]
    Dense,
    /// Keeps one packed record per pooled output. Norm1 only.
    Fused,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Optimizer steps per layer.
    pub epochs: usize,
    pub adam: AdamConfig,
    pub metric: QoidMetric,
    pub conv_kernel: ConvKernel,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        TrainingConfig {
            epochs: 1,
            adam: AdamConfig::default(),
            metric: QoidMetric::Norm1,
            conv_kernel: ConvKernel::Dense,
        }
    }
}

impl TrainingConfig {
    /// Parse a (possibly partial) JSON config; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let config: TrainingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.adam;
        for (what, value, ok) in [
            ("adam beta1", a.beta1, (0.0..1.0).contains(&a.beta1)),
            ("adam beta2", a.beta2, (0.0..1.0).contains(&a.beta2)),
            ("adam lr", a.lr, a.lr > 0.0 && a.lr.is_finite()),
            ("adam eps", a.eps, a.eps > 0.0),
        ] {
            if !ok {
                return Err(ConfigError::InvalidHyperparameter { what, value });
            }
        }
        if self.conv_kernel == ConvKernel::Fused && self.metric != QoidMetric::Norm1 {
            return Err(ConfigError::FusedRequiresNorm1);
        }
        Ok(())
    }
}

// ── State machine ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    ForwardTrain,
    ComputeLoss,
    ZeroGradients,
    BackwardAccumulate(usize),
    OptimizerStep,
    ForwardInferenceFinal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainState {
    Layer { layer: usize, epoch: usize, phase: Phase },
    Done,
}

impl TrainState {
    fn layer_entry(layer: usize, epochs: usize) -> Self {
        let phase = if epochs == 0 { Phase::ForwardInferenceFinal } else { Phase::ForwardTrain };
        TrainState::Layer { layer, epoch: 0, phase }
    }

    pub fn start(epochs: usize) -> Self {
        Self::layer_entry(FIRST_CONV_LAYER, epochs)
    }

    /// Successor of `self` in a run of `epochs` epochs per layer.
    pub fn next(self, epochs: usize) -> Self {
        let TrainState::Layer { layer, epoch, phase } = self else {
            return TrainState::Done;
        };
        let at = |phase| TrainState::Layer { layer, epoch, phase };
        match phase {
            Phase::ForwardTrain => at(Phase::ComputeLoss),
            Phase::ComputeLoss => at(Phase::ZeroGradients),
            Phase::ZeroGradients => at(Phase::BackwardAccumulate(0)),
            Phase::BackwardAccumulate(s) if s + 1 < QUAD => at(Phase::BackwardAccumulate(s + 1)),
            Phase::BackwardAccumulate(_) => at(Phase::OptimizerStep),
            Phase::OptimizerStep if epoch + 1 < epochs => {
                TrainState::Layer { layer, epoch: epoch + 1, phase: Phase::ForwardTrain }
            }
            Phase::OptimizerStep => at(Phase::ForwardInferenceFinal),
            Phase::ForwardInferenceFinal if layer < NUM_LAYERS => Self::layer_entry(layer + 1, epochs),
            Phase::ForwardInferenceFinal => TrainState::Done,
        }
    }

    pub fn layer(&self) -> Option<usize> {
        match self {
            TrainState::Layer { layer, .. } => Some(*layer),
            TrainState::Done => None,
        }
    }
}

// ── Reports ─────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerReport {
    pub layer: usize,
    /// Loss at the first `ComputeLoss` (None when trained for 0 epochs).
    pub initial_loss: Option<f32>,
    /// Loss of the `ForwardInferenceFinal` outputs.
    pub final_loss: f32,
    pub epochs: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TrainingReport {
    pub layers: Vec<LayerReport>,
    /// Class probabilities of the four samples after training.
    pub probabilities: Quad<[f32; NUM_CLASSES]>,
}

// ── Layer sessions ──────────────────────────────────────────────────

/// Everything one layer holds while it trains. Phases are called in
/// `TrainState` order; `forward_inference_final` returns the layer's outputs
/// for the four samples and their loss.
trait LayerSession {
    fn forward_train(&mut self) -> Result<(), EngineError>;
    fn compute_loss(&mut self) -> f32;
    fn zero_gradients(&mut self);
    fn backward_accumulate(&mut self, sample: usize);
    fn optimizer_step(&mut self);
    fn forward_inference_final(&mut self) -> Result<(Quad<Vec<f32>>, f32), EngineError>;
}

fn refs(q: &Quad<Vec<f32>>) -> Quad<&[f32]> {
    [&q[0], &q[1], &q[2], &q[3]]
}

fn qoid_loss_of(metric: QoidMetric, y: &Quad<Vec<f32>>) -> f32 {
    update_loss_qoid(metric, refs(y)).loss()
}

struct DenseConvSession<'a> {
    block: &'a mut ConvBlock,
    metric: QoidMetric,
    inputs: Quad<Vec<f32>>,
    caches: Vec<ConvBlockCache>,
    state: QoidState,
    grads: LayerGrads,
    scratch: ConvBackwardScratch,
    adam_w: AdamState,
    adam_b: AdamState,
}

impl<'a> DenseConvSession<'a> {
    fn new(block: &'a mut ConvBlock, inputs: Quad<Vec<f32>>, config: &TrainingConfig) -> Result<Self, EngineError> {
        let g = block.geometry;
        Ok(DenseConvSession {
            metric: config.metric,
            inputs,
            caches: Vec::with_capacity(QUAD),
            state: QoidState::from_distances(config.metric, [0.0; 6], g.output_size()),
            grads: LayerGrads::new(g.filters_len(), g.bias_len())?,
            scratch: ConvBackwardScratch::new(&g)?,
            adam_w: AdamState::new(g.filters_len(), config.adam),
            adam_b: AdamState::new(g.bias_len(), config.adam),
            block,
        })
    }

    fn outputs(&self) -> Quad<&[f32]> {
        [&self.caches[0].pooled, &self.caches[1].pooled, &self.caches[2].pooled, &self.caches[3].pooled]
    }
}

impl LayerSession for DenseConvSession<'_> {
    fn forward_train(&mut self) -> Result<(), EngineError> {
        self.caches.clear();
        for x in &self.inputs {
            self.caches.push(conv_block_forward(self.block, x)?);
        }
        Ok(())
    }

    fn compute_loss(&mut self) -> f32 {
        self.state = update_loss_qoid(self.metric, self.outputs());
        self.state.loss()
    }

    fn zero_gradients(&mut self) {
        self.grads.zero();
    }

    fn backward_accumulate(&mut self, sample: usize) {
        let outputs = [
            &self.caches[0].pooled[..],
            &self.caches[1].pooled[..],
            &self.caches[2].pooled[..],
            &self.caches[3].pooled[..],
        ];
        dldw_dldb_conv1d_block_qoid(
            self.block,
            &self.state,
            outputs,
            sample,
            &self.inputs[sample],
            &self.caches[sample],
            &mut self.grads,
            &mut self.scratch,
        );
    }

    fn optimizer_step(&mut self) {
        self.adam_w.step(&mut self.block.filters, &self.grads.w);
        self.adam_b.step(&mut self.block.bias, &self.grads.b);
    }

    fn forward_inference_final(&mut self) -> Result<(Quad<Vec<f32>>, f32), EngineError> {
        let b: &ConvBlock = self.block;
        let y = [
            conv_block_forward(b, &self.inputs[0])?.pooled,
            conv_block_forward(b, &self.inputs[1])?.pooled,
            conv_block_forward(b, &self.inputs[2])?.pooled,
            conv_block_forward(b, &self.inputs[3])?.pooled,
        ];
        let loss = qoid_loss_of(self.metric, &y);
        Ok((y, loss))
    }
}

struct FusedConvSession<'a> {
    block: &'a mut ConvBlock,
    inputs: Quad<Vec<f32>>,
    records: Vec<PackedBackwardRecord>,
    state: QoidState,
    grads: LayerGrads,
    adam_w: AdamState,
    adam_b: AdamState,
}

impl<'a> FusedConvSession<'a> {
    fn new(block: &'a mut ConvBlock, inputs: Quad<Vec<f32>>, config: &TrainingConfig) -> Result<Self, EngineError> {
        let g = block.geometry;
        Ok(FusedConvSession {
            inputs,
            records: Vec::new(),
            state: QoidState::from_distances(QoidMetric::Norm1, [0.0; 6], g.output_size()),
            grads: LayerGrads::new(g.filters_len(), g.bias_len())?,
            adam_w: AdamState::new(g.filters_len(), config.adam),
            adam_b: AdamState::new(g.bias_len(), config.adam),
            block,
        })
    }
}

impl LayerSession for FusedConvSession<'_> {
    fn forward_train(&mut self) -> Result<(), EngineError> {
        let (records, state) = forward_dldy_conv1d_bn_relu_maxpool_4(self.block, refs(&self.inputs))?;
        self.records = records;
        self.state = state;
        Ok(())
    }

    fn compute_loss(&mut self) -> f32 {
        // Distances were accumulated during the fused forward scan.
        self.state.loss()
    }

    fn zero_gradients(&mut self) {
        self.grads.zero();
    }

    fn backward_accumulate(&mut self, sample: usize) {
        backward_optimized_conv1d_bn_relu_maxpool(
            self.block,
            &self.inputs[sample],
            sample,
            &self.records,
            &self.state,
            &mut self.grads,
        );
    }

    fn optimizer_step(&mut self) {
        adam_step_optimized(self.block, &self.grads, &mut self.adam_w, &mut self.adam_b);
    }

    fn forward_inference_final(&mut self) -> Result<(Quad<Vec<f32>>, f32), EngineError> {
        let y = forward_output_conv1d_bn_relu_maxpool_4(self.block, refs(&self.inputs))?;
        let loss = qoid_loss_of(QoidMetric::Norm1, &y);
        Ok((y, loss))
    }
}

struct EmbeddingSession<'a> {
    layer: &'a mut DenseLayer,
    metric: QoidMetric,
    inputs: Quad<Vec<f32>>,
    caches: Vec<DenseCache>,
    state: QoidState,
    grads: LayerGrads,
    dldy: Vec<f32>,
    adam_w: AdamState,
    adam_b: AdamState,
}

impl<'a> EmbeddingSession<'a> {
    fn new(layer: &'a mut DenseLayer, inputs: Quad<Vec<f32>>, config: &TrainingConfig) -> Result<Self, EngineError> {
        Ok(EmbeddingSession {
            metric: config.metric,
            inputs,
            caches: Vec::with_capacity(QUAD),
            state: QoidState::from_distances(config.metric, [0.0; 6], layer.out_size),
            grads: LayerGrads::new(layer.weights.len(), layer.bias.len())?,
            dldy: try_zeros("embedding gradient", layer.out_size)?,
            adam_w: AdamState::new(layer.weights.len(), config.adam),
            adam_b: AdamState::new(layer.bias.len(), config.adam),
            layer,
        })
    }
}

impl LayerSession for EmbeddingSession<'_> {
    fn forward_train(&mut self) -> Result<(), EngineError> {
        self.caches.clear();
        for x in &self.inputs {
            self.caches.push(embedding_forward(self.layer, x)?);
        }
        Ok(())
    }

    fn compute_loss(&mut self) -> f32 {
        let outputs = [
            &self.caches[0].output[..],
            &self.caches[1].output[..],
            &self.caches[2].output[..],
            &self.caches[3].output[..],
        ];
        self.state = update_loss_qoid(self.metric, outputs);
        self.state.loss()
    }

    fn zero_gradients(&mut self) {
        self.grads.zero();
    }

    fn backward_accumulate(&mut self, sample: usize) {
        let outputs = [
            &self.caches[0].output[..],
            &self.caches[1].output[..],
            &self.caches[2].output[..],
            &self.caches[3].output[..],
        ];
        dldw_dldb_embedding_qoid(
            &self.state,
            outputs,
            sample,
            &self.inputs[sample],
            &self.caches[sample],
            &mut self.grads,
            &mut self.dldy,
        );
    }

    fn optimizer_step(&mut self) {
        self.adam_w.step(&mut self.layer.weights, &self.grads.w);
        self.adam_b.step(&mut self.layer.bias, &self.grads.b);
    }

    fn forward_inference_final(&mut self) -> Result<(Quad<Vec<f32>>, f32), EngineError> {
        let l: &DenseLayer = self.layer;
        let y = [
            embedding_forward(l, &self.inputs[0])?.output,
            embedding_forward(l, &self.inputs[1])?.output,
            embedding_forward(l, &self.inputs[2])?.output,
            embedding_forward(l, &self.inputs[3])?.output,
        ];
        let loss = qoid_loss_of(self.metric, &y);
        Ok((y, loss))
    }
}

struct OutputSession<'a> {
    layer: &'a mut DenseLayer,
    inputs: Quad<Vec<f32>>,
    caches: Vec<DenseCache>,
    grads: LayerGrads,
    dldz: Vec<f32>,
    adam_w: AdamState,
    adam_b: AdamState,
}

impl<'a> OutputSession<'a> {
    fn new(layer: &'a mut DenseLayer, inputs: Quad<Vec<f32>>, config: &TrainingConfig) -> Result<Self, EngineError> {
        Ok(OutputSession {
            inputs,
            caches: Vec::with_capacity(QUAD),
            grads: LayerGrads::new(layer.weights.len(), layer.bias.len())?,
            dldz: try_zeros("output gradient", layer.out_size)?,
            adam_w: AdamState::new(layer.weights.len(), config.adam),
            adam_b: AdamState::new(layer.bias.len(), config.adam),
            layer,
        })
    }
}

impl LayerSession for OutputSession<'_> {
    fn forward_train(&mut self) -> Result<(), EngineError> {
        self.caches.clear();
        for x in &self.inputs {
            self.caches.push(output_forward(self.layer, x)?);
        }
        Ok(())
    }

    fn compute_loss(&mut self) -> f32 {
        self.caches
            .iter()
            .zip(QUAD_LABELS)
            .map(|(c, label)| categorical_cross_entropy(&c.output, label))
            .sum()
    }

    fn zero_gradients(&mut self) {
        self.grads.zero();
    }

    fn backward_accumulate(&mut self, sample: usize) {
        dldw_dldb_output_ce(
            self.layer,
            &self.inputs[sample],
            &self.caches[sample],
            QUAD_LABELS[sample],
            &mut self.grads,
            &mut self.dldz,
        );
    }

    fn optimizer_step(&mut self) {
        self.adam_w.step(&mut self.layer.weights, &self.grads.w);
        self.adam_b.step(&mut self.layer.bias, &self.grads.b);
    }

    fn forward_inference_final(&mut self) -> Result<(Quad<Vec<f32>>, f32), EngineError> {
        let l: &DenseLayer = self.layer;
        let y = [
            output_forward(l, &self.inputs[0])?.output,
            output_forward(l, &self.inputs[1])?.output,
            output_forward(l, &self.inputs[2])?.output,
            output_forward(l, &self.inputs[3])?.output,
        ];
        let loss: f32 = y.iter().zip(QUAD_LABELS).map(|(p, label)| categorical_cross_entropy(p, label)).sum();
        Ok((y, loss))
    }
}

fn open_session<'a>(
    params: &'a mut NetworkParameters,
    layer: usize,
    inputs: Quad<Vec<f32>>,
    config: &TrainingConfig,
) -> Result<Box<dyn LayerSession + 'a>, EngineError> {
    let session: Box<dyn LayerSession + 'a> = match layer {
        FIRST_CONV_LAYER..=LAST_CONV_LAYER => {
            let block = params.conv_block_mut(layer)?;
            match config.conv_kernel {
                ConvKernel::Dense => Box::new(DenseConvSession::new(block, inputs, config)?),
                ConvKernel::Fused => Box::new(FusedConvSession::new(block, inputs, config)?),
            }
        }
        EMBEDDING_LAYER => Box::new(EmbeddingSession::new(params.dense_layer_mut(layer)?, inputs, config)?),
        OUTPUT_LAYER => Box::new(OutputSession::new(params.dense_layer_mut(layer)?, inputs, config)?),
        _ => return Err(ConfigError::LayerOutOfRange { layer, min: FIRST_CONV_LAYER, max: NUM_LAYERS }.into()),
    };
    Ok(session)
}

/// Drive one layer from its entry state to the first state of the next
/// layer (or `Done`). Returns that state, the layer's final outputs and its report.
fn run_layer(
    params: &mut NetworkParameters,
    entry: TrainState,
    inputs: Quad<Vec<f32>>,
    config: &TrainingConfig,
) -> Result<(TrainState, Quad<Vec<f32>>, LayerReport), EngineError> {
    let Some(layer) = entry.layer() else {
        return Err(ConfigError::LayerOutOfRange { layer: 0, min: FIRST_CONV_LAYER, max: NUM_LAYERS }.into());
    };
    info!(layer, epochs = config.epochs, "layer training started");
    let mut session = open_session(params, layer, inputs, config)?;
    let mut initial_loss = None;
    let mut state = entry;

    loop {
        let TrainState::Layer { layer: current, epoch, phase } = state else { break };
        if current != layer {
            break;
        }
        match phase {
            Phase::ForwardTrain => session.forward_train()?,
            Phase::ComputeLoss => {
                let loss = session.compute_loss();
                if !loss.is_finite() {
                    warn!(layer, epoch, loss, "non-finite training loss");
                }
                debug!(layer, epoch, loss, "epoch loss");
                initial_loss.get_or_insert(loss);
            }
            Phase::ZeroGradients => session.zero_gradients(),
            Phase::BackwardAccumulate(sample) => session.backward_accumulate(sample),
            Phase::OptimizerStep => session.optimizer_step(),
            Phase::ForwardInferenceFinal => {
                let (outputs, final_loss) = session.forward_inference_final()?;
                if !final_loss.is_finite() {
                    warn!(layer, loss = final_loss, "non-finite loss after training");
                }
                info!(layer, initial_loss = ?initial_loss, final_loss, "layer training finished");
                let next = state.next(config.epochs);
                trace!(?state, ?next, "transition");
                let report = LayerReport { layer, initial_loss, final_loss, epochs: config.epochs };
                return Ok((next, outputs, report));
            }
        }
        let next = state.next(config.epochs);
        trace!(?state, ?next, "transition");
        state = next;
    }
    // Every layer cycle ends in ForwardInferenceFinal, which returns above.
    Err(ConfigError::Incomplete { layer }.into())
}

/// Checks that need no mutation: network completeness, sample shapes and
/// kernel/metric compatibility.
fn preflight(params: &NetworkParameters, quad: &Quadruple, config: &TrainingConfig) -> Result<(), EngineError> {
    params.validate()?;
    config.validate()?;
    let input = params.input_params()?;
    let expected = input.input_len * input.input_depth;
    if let Some(s) = quad.samples.iter().find(|s| s.len() != expected) {
        return Err(ConfigError::LengthMismatch { what: "training sample", expected, found: s.len() }.into());
    }
    if config.conv_kernel == ConvKernel::Fused {
        for layer in FIRST_CONV_LAYER..=LAST_CONV_LAYER {
            let pool_size = params.conv_block(layer)?.geometry.pool_size;
            if pool_size > MAX_PACKED_POOL {
                return Err(ConfigError::PoolTooLarge { pool_size, max: MAX_PACKED_POOL }.into());
            }
        }
    }
    Ok(())
}

/// Train all five layers in sequence, updating `params` in place.
///
/// Configuration problems are reported before any weight changes. An
/// allocation failure mid-run aborts with the layers trained so far kept.
pub fn train_with_config(
    params: &mut NetworkParameters,
    quad: &Quadruple,
    config: &TrainingConfig,
) -> Result<TrainingReport, EngineError> {
    preflight(params, quad, config)?;
    let input = params.input_params()?;
    let mut x = [
        prepare_input(&input, &quad.samples[0])?,
        prepare_input(&input, &quad.samples[1])?,
        prepare_input(&input, &quad.samples[2])?,
        prepare_input(&input, &quad.samples[3])?,
    ];

    let mut layers = Vec::with_capacity(NUM_LAYERS);
    let mut state = TrainState::start(config.epochs);
    while state != TrainState::Done {
        let (next, outputs, report) = run_layer(params, state, x, config)?;
        layers.push(report);
        x = outputs;
        state = next;
    }

    let mut probabilities = [[0.0f32; NUM_CLASSES]; QUAD];
    for (p, y) in probabilities.iter_mut().zip(x.iter()) {
        p.copy_from_slice(y);
    }
    Ok(TrainingReport { layers, probabilities })
}

/// Train with default hyperparameters (Norm1 QOID, dense conv kernel).
pub fn training_seizdet_cnn(
    params: &mut NetworkParameters,
    quad: &Quadruple,
    epochs: usize,
) -> Result<TrainingReport, EngineError> {
    train_with_config(params, quad, &TrainingConfig { epochs, ..TrainingConfig::default() })
}
