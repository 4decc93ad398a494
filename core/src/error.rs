/// Error types for network configuration and training.
///
/// Configuration errors are raised by the `set_*` entry points and by the
/// pre-flight check of the training run. Numerical degeneracy is never an
/// error: near-zero QOID distances are guarded with an additive epsilon.

use thiserror::Error;

/// Rejected network configuration. The parameters are left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{what} must be non-zero")]
    ZeroDimension { what: &'static str },

    #[error("layer index {layer} out of range {min}..={max}")]
    LayerOutOfRange { layer: usize, min: usize, max: usize },

    #[error("{what}: expected {expected} elements, got {found}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("layer {layer} expects {what} {found}, previous layer produces {expected}")]
    ChainMismatch {
        layer: usize,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("layer {layer} configured before layer {missing}")]
    MissingPredecessor { layer: usize, missing: usize },

    #[error("layer {layer} produces no output (conv_len={conv_len}, pool_size={pool_size})")]
    EmptyOutput {
        layer: usize,
        conv_len: usize,
        pool_size: usize,
    },

    #[error("pool size {pool_size} does not fit a 4-bit packed index (max {max})")]
    PoolTooLarge { pool_size: usize, max: usize },

    #[error("network incomplete: layer {layer} not configured")]
    Incomplete { layer: usize },

    #[error("fused conv kernel supports only the Norm1 QOID metric")]
    FusedRequiresNorm1,

    #[error("{what} out of range ({value})")]
    InvalidHyperparameter { what: &'static str, value: f32 },

    #[error("batch-norm variance for channel {channel} is negative ({value})")]
    NegativeVariance { channel: usize, value: f32 },

    /// `running_var + eps` is zero or not finite, so the BN slope is unbounded.
    #[error("batch-norm variance + eps for channel {channel} is not a positive finite value ({value})")]
    DegenerateVariance { channel: usize, value: f32 },
}

/// Any failure that aborts a training or inference run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to allocate {elements} elements for {what}")]
    Allocation { what: &'static str, elements: usize },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed checkpoint or training config JSON.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
