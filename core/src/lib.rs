pub mod error;
pub mod tensor;
pub mod conv1d;
pub mod batch_norm;
pub mod normalization;
pub mod pooling;
pub mod dense;
pub mod qoid;
pub mod adam;
pub mod model;
pub mod forward;
pub mod backward;
pub mod fused;
pub mod gradient;
pub mod training;

pub use error::{ConfigError, EngineError};
pub use model::{load_checkpoint, save_checkpoint, NetworkParameters};
pub use training::{train_with_config, training_seizdet_cnn, Quadruple, TrainingConfig, TrainingReport};
