//! Contracts the trainer consumes from the network being optimized.
//!
//! The architecture itself lives outside this crate. A model only has to
//! expose its per-head outputs, its trainable variables in a stable order and
//! the mode switches the training loop toggles.

use candle_core::{Result, Tensor, Var};

/// Epsilon forced onto frozen batch-norm layers. Pretrained running
/// variances can be as small as 1e-17.
pub const FROZEN_BATCH_NORM_EPS: f64 = 1e-4;

/// A multi-head network trained by [`crate::Trainer`].
pub trait PoseModel {
    /// Runs the network, returning one output tensor per head.
    fn forward(&self, input: &Tensor) -> Result<Vec<Tensor>>;

    /// Trainable variables with their names. The order must be stable across
    /// calls: EMA shadows and restore buffers are matched by position.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Normalization layers that can be frozen. Models without batch norm
    /// keep the default.
    fn batch_norms_mut(&mut self) -> Vec<&mut dyn BatchNormLayer> {
        Vec::new()
    }

    /// The single-device module behind a data-parallel wrapper, if any.
    /// Checkpoints are written from the unwrapped module.
    fn unwrap_data_parallel(&self) -> Option<&dyn PoseModel> {
        None
    }
}

/// Batch-norm sub-module as seen by the batch-norm freeze.
pub trait BatchNormLayer {
    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    fn eps(&self) -> f64;

    fn set_eps(&mut self, eps: f64);
}

/// Puts every batch-norm layer into evaluation mode and widens its epsilon.
/// Returns the number of layers touched.
pub fn freeze_batch_norm(model: &mut dyn PoseModel) -> usize {
    let mut frozen = 0;
    for layer in model.batch_norms_mut() {
        layer.set_training(false);
        layer.set_eps(FROZEN_BATCH_NORM_EPS);
        frozen += 1;
    }
    frozen
}

/// Returns the variables of `model` without their names.
pub fn parameter_vars(model: &dyn PoseModel) -> Vec<Var> {
    model
        .parameters()
        .into_iter()
        .map(|(_, var)| var)
        .collect()
}
