use candle_core::{backprop::GradStore, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::{config, TrainingError};

/// Parameter update rule driven by the trainer.
///
/// Gradients are handed over explicitly: the trainer owns the accumulated
/// [`GradStore`] and drops it after every step, which is what zeroing the
/// gradients means here.
pub trait ParameterOptimizer {
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);
}

/// Adapter exposing any candle-nn optimizer as a [`ParameterOptimizer`].
#[derive(Debug)]
pub struct CandleOptimizer<O> {
    inner: O,
}

impl<O: Optimizer> CandleOptimizer<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O: Optimizer> ParameterOptimizer for CandleOptimizer<O> {
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr)
    }
}

/// Builds the configured optimizer over `vars`.
pub fn build_optimizer(
    vars: Vec<Var>,
    config: &config::OptimizerConfig,
) -> Result<Box<dyn ParameterOptimizer>, TrainingError> {
    if vars.is_empty() {
        return Err(TrainingError::initialization(
            "optimizer requires at least one parameter",
        ));
    }
    if let Some((index, _)) = vars
        .iter()
        .enumerate()
        .find(|(_, var)| !var.as_tensor().dtype().is_float())
    {
        return Err(TrainingError::initialization(format!(
            "optimizer received non-floating parameter #{index}"
        )));
    }

    log::info!(
        "optimizer {:?} tracks {} tensor(s) at lr={}",
        config.algorithm,
        vars.len(),
        config.learning_rate
    );

    match config.algorithm {
        config::OptimizerType::Sgd => {
            let sgd = SGD::new(vars, config.learning_rate)?;
            Ok(Box::new(CandleOptimizer::new(sgd)))
        }
        config::OptimizerType::Adam | config::OptimizerType::AdamW => {
            let weight_decay = match config.algorithm {
                config::OptimizerType::Adam => 0.0,
                _ => config.weight_decay,
            };
            let params = ParamsAdamW {
                lr: config.learning_rate,
                beta1: config.beta1,
                beta2: config.beta2,
                eps: config.epsilon,
                weight_decay,
            };
            let adamw = AdamW::new(vars, params)?;
            Ok(Box::new(CandleOptimizer::new(adamw)))
        }
    }
}
