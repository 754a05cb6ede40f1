#![allow(dead_code)]

use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use pose_training::{
    checkpoint::{CheckpointRecord, CheckpointSink},
    data::{InMemoryLoader, SceneBatch},
    logging::{LogRecord, LogSink},
    model::{BatchNormLayer, PoseModel},
    optimizer::ParameterOptimizer,
    HeadLoss, MultiHeadLoss, TrainingError,
};

/// Single-head linear model: `x @ weight + bias` with `x` of shape `(n, 2)`.
pub struct LinearPose {
    weight: Var,
    bias: Var,
    training: bool,
    pub norms: Vec<ToyBatchNorm>,
}

impl LinearPose {
    pub fn new(weight: [f32; 2], bias: f32) -> Self {
        let weight =
            Var::from_tensor(&Tensor::new(&[[weight[0]], [weight[1]]], &Device::Cpu).unwrap())
                .unwrap();
        let bias = Var::new(&[bias], &Device::Cpu).unwrap();
        Self {
            weight,
            bias,
            training: false,
            norms: vec![ToyBatchNorm::default(), ToyBatchNorm::default()],
        }
    }

    pub fn values(&self) -> Vec<f32> {
        let mut values = self.weight.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        values.extend(self.bias.as_tensor().to_vec1::<f32>().unwrap());
        values
    }
}

impl PoseModel for LinearPose {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        let output = input
            .matmul(self.weight.as_tensor())?
            .broadcast_add(self.bias.as_tensor())?;
        Ok(vec![output])
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("weight".to_string(), self.weight.clone()),
            ("bias".to_string(), self.bias.clone()),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        for norm in &mut self.norms {
            norm.training = training;
        }
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn batch_norms_mut(&mut self) -> Vec<&mut dyn BatchNormLayer> {
        self.norms
            .iter_mut()
            .map(|norm| norm as &mut dyn BatchNormLayer)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ToyBatchNorm {
    pub training: bool,
    pub eps: f64,
}

impl Default for ToyBatchNorm {
    fn default() -> Self {
        Self {
            training: false,
            eps: 1e-5,
        }
    }
}

impl BatchNormLayer for ToyBatchNorm {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn eps(&self) -> f64 {
        self.eps
    }

    fn set_eps(&mut self, eps: f64) {
        self.eps = eps;
    }
}

/// Wrapper that exposes its inner module's parameters under `module.`.
pub struct DataParallel<M> {
    pub module: M,
}

impl<M: PoseModel> PoseModel for DataParallel<M> {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Vec<Tensor>> {
        self.module.forward(input)
    }

    fn parameters(&self) -> Vec<(String, Var)> {
        self.module
            .parameters()
            .into_iter()
            .map(|(name, var)| (format!("module.{name}"), var))
            .collect()
    }

    fn set_training(&mut self, training: bool) {
        self.module.set_training(training)
    }

    fn is_training(&self) -> bool {
        self.module.is_training()
    }

    fn batch_norms_mut(&mut self) -> Vec<&mut dyn BatchNormLayer> {
        self.module.batch_norms_mut()
    }

    fn unwrap_data_parallel(&self) -> Option<&dyn PoseModel> {
        Some(&self.module as &dyn PoseModel)
    }
}

pub fn mse(output: &Tensor, targets: &[Tensor]) -> candle_core::Result<Vec<Option<Tensor>>> {
    let loss = output.sub(&targets[0])?.sqr()?.mean_all()?;
    Ok(vec![Some(loss)])
}

/// MSE plus a second sub-loss that never applies.
pub fn mse_and_absent(
    output: &Tensor,
    targets: &[Tensor],
) -> candle_core::Result<Vec<Option<Tensor>>> {
    let mut losses = mse(output, targets)?;
    losses.push(None);
    Ok(losses)
}

pub fn absent(_output: &Tensor, _targets: &[Tensor]) -> candle_core::Result<Vec<Option<Tensor>>> {
    Ok(vec![None])
}

pub fn mse_loss(lambda: f64) -> MultiHeadLoss {
    MultiHeadLoss::new(vec![Box::new(mse) as Box<dyn HeadLoss>], vec![lambda]).unwrap()
}

/// `n` batches of two zero inputs with target `target`.
pub fn constant_loader(n: usize, target: f32) -> InMemoryLoader {
    let batches = (0..n)
        .map(|_| {
            SceneBatch::new(
                Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
                vec![vec![Tensor::full(target, (2, 1), &Device::Cpu).unwrap()]],
            )
        })
        .collect();
    InMemoryLoader::new(batches)
}

/// `n` batches drawn from a fixed line `y = 2 x0 - x1 + 0.5`.
pub fn line_loader(n: usize) -> InMemoryLoader {
    let batches = (0..n)
        .map(|i| {
            let offset = i as f32 * 0.25;
            let inputs = [[1.0 + offset, 0.5], [-0.5, 2.0 - offset]];
            let targets: Vec<f32> = inputs
                .iter()
                .map(|[x0, x1]| 2.0 * x0 - x1 + 0.5)
                .collect();
            SceneBatch::new(
                Tensor::new(&inputs, &Device::Cpu).unwrap(),
                vec![vec![Tensor::from_vec(targets, (2, 1), &Device::Cpu).unwrap()]],
            )
        })
        .collect();
    InMemoryLoader::new(batches)
}

/// Records the flattened gradient of every variable at each step without
/// updating anything.
pub struct RecordingOptimizer {
    vars: Vec<Var>,
    lr: f64,
    steps: Rc<RefCell<Vec<Vec<f32>>>>,
}

impl RecordingOptimizer {
    pub fn new(model: &dyn PoseModel) -> (Self, Rc<RefCell<Vec<Vec<f32>>>>) {
        let steps = Rc::new(RefCell::new(Vec::new()));
        let optimizer = Self {
            vars: model.parameters().into_iter().map(|(_, var)| var).collect(),
            lr: 1.0,
            steps: Rc::clone(&steps),
        };
        (optimizer, steps)
    }
}

impl ParameterOptimizer for RecordingOptimizer {
    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let mut flat = Vec::new();
        for var in &self.vars {
            match grads.get(var.as_tensor()) {
                Some(grad) => flat.extend(grad.flatten_all()?.to_vec1::<f32>()?),
                None => flat.extend(vec![0.0; var.as_tensor().elem_count()]),
            }
        }
        self.steps.borrow_mut().push(flat);
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    records: Rc<RefCell<Vec<LogRecord>>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.borrow().clone()
    }
}

impl LogSink for RecordingSink {
    fn record(&mut self, record: &LogRecord) {
        self.records.borrow_mut().push(record.clone());
    }
}

#[derive(Clone, Default)]
pub struct RecordingCheckpoints {
    saved: Rc<RefCell<Vec<(PathBuf, CheckpointRecord)>>>,
}

impl RecordingCheckpoints {
    pub fn saved(&self) -> Vec<(PathBuf, CheckpointRecord)> {
        self.saved.borrow().clone()
    }
}

impl CheckpointSink for RecordingCheckpoints {
    fn save(&mut self, path: &Path, record: &CheckpointRecord) -> Result<(), TrainingError> {
        self.saved
            .borrow_mut()
            .push((path.to_path_buf(), record.clone()));
        Ok(())
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-5,
        "expected {expected}, got {actual}"
    );
}
