use std::path::{Path, PathBuf};

use candle_core::{backprop::GradStore, Device, Tensor, Var};
use serde_json::Value;

use crate::{
    checkpoint::{self, CheckpointRecord, CheckpointSink, SafetensorsCheckpoint},
    config::{OptimizerConfig, TrainingConfig},
    data::{DataLoader, SceneBatch},
    ema::ParameterEma,
    logging::{EpochRecord, LogRecord, LogSink, Logger, LoggingSettings, NullSink, TrainBatchRecord},
    loss::{CombinedLoss, HeadLoss, LossValues, MultiHeadLoss},
    metrics::{round_optional, round_to, BatchClock, EpochLosses},
    model::{freeze_batch_norm, parameter_vars, PoseModel},
    optimizer::{build_optimizer, ParameterOptimizer},
    profile::{BatchPhase, BatchProfiler},
    scheduler::{self, LRScheduler},
    TrainingError,
};

/// Hook that sees every training batch before it is moved to the device.
pub trait EncoderVisualizer {
    fn visualize(&mut self, data: &Tensor, targets: &[Vec<Tensor>], meta: &[Value]);
}

impl<F> EncoderVisualizer for F
where
    F: FnMut(&Tensor, &[Vec<Tensor>], &[Value]),
{
    fn visualize(&mut self, data: &Tensor, targets: &[Vec<Tensor>], meta: &[Value]) {
        self(data, targets, meta)
    }
}

#[derive(Debug, Clone)]
pub struct TrainerSettings {
    /// Final checkpoint path.
    pub output: PathBuf,
    pub epochs: usize,
    pub resume: Option<PathBuf>,
    /// Device batches are moved to. `None` leaves them where the loader put them.
    pub device: Option<Device>,
    pub log_interval: usize,
    /// Number of batches whose gradients are summed before an optimizer step.
    pub stride_apply: usize,
    pub ema_decay: Option<f64>,
    pub fix_batch_norm: bool,
    /// Chrome trace destination; selects the profiled train-batch path.
    pub profile: Option<PathBuf>,
    /// Stored verbatim in every checkpoint.
    pub model_meta: Value,
}

impl TrainerSettings {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            epochs: 1,
            resume: None,
            device: None,
            log_interval: 10,
            stride_apply: 1,
            ema_decay: None,
            fix_batch_norm: false,
            profile: None,
            model_meta: Value::Null,
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Result<Self, TrainingError> {
        let runtime = &config.runtime;
        Ok(Self {
            output: config.output.clone(),
            epochs: config.epochs,
            resume: config.resume.clone(),
            device: Some(runtime.device.resolve()?),
            log_interval: runtime.log_interval,
            stride_apply: runtime.stride_apply,
            ema_decay: runtime.ema_decay,
            fix_batch_norm: runtime.fix_batch_norm,
            profile: runtime.profile.clone(),
            model_meta: Value::Null,
        })
    }

    pub fn with_model_meta(mut self, meta: Value) -> Self {
        self.model_meta = meta;
        self
    }

    fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();
        if self.log_interval == 0 {
            errors.push("log_interval must be greater than 0".to_string());
        }
        if self.stride_apply == 0 {
            errors.push("stride_apply must be greater than 0".to_string());
        }
        if let Some(decay) = self.ema_decay {
            if !(0.0 < decay && decay <= 1.0) {
                errors.push("ema_decay must be in (0, 1]".to_string());
            }
        }
        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }
        Ok(())
    }
}

pub struct TrainerBuilder<M> {
    model: M,
    loss: MultiHeadLoss,
    settings: TrainerSettings,
    optimizer: Option<Box<dyn ParameterOptimizer>>,
    optimizer_config: OptimizerConfig,
    scheduler: Option<Box<dyn LRScheduler>>,
    log_sink: Option<Box<dyn LogSink>>,
    checkpoint_sink: Option<Box<dyn CheckpointSink>>,
    visualizer: Option<Box<dyn EncoderVisualizer>>,
}

impl<M: PoseModel> TrainerBuilder<M> {
    /// Uses `optimizer` instead of building one from the optimizer config.
    pub fn optimizer(mut self, optimizer: Box<dyn ParameterOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn optimizer_config(mut self, config: OptimizerConfig) -> Self {
        self.optimizer_config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Box<dyn LRScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn log_sink(mut self, sink: impl LogSink + 'static) -> Self {
        self.log_sink = Some(Box::new(sink));
        self
    }

    pub fn checkpoint_sink(mut self, sink: impl CheckpointSink + 'static) -> Self {
        self.checkpoint_sink = Some(Box::new(sink));
        self
    }

    pub fn encoder_visualizer(mut self, visualizer: impl EncoderVisualizer + 'static) -> Self {
        self.visualizer = Some(Box::new(visualizer));
        self
    }

    pub fn build(self) -> Result<Trainer<M>, TrainingError> {
        self.settings.validate()?;

        let parameters = parameter_vars(&self.model);
        if parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model exposes no trainable parameters",
            ));
        }

        let mut optimizer = match self.optimizer {
            Some(optimizer) => optimizer,
            None => build_optimizer(parameters.clone(), &self.optimizer_config)?,
        };
        if let Some(scheduler) = self.scheduler.as_ref() {
            optimizer.set_learning_rate(scheduler.learning_rate());
        }

        let profiler = self.settings.profile.as_ref().map(|path| {
            log::info!("profiling train batches to {}", path.display());
            BatchProfiler::new(path)
        });

        Ok(Trainer {
            model: self.model,
            loss: self.loss,
            optimizer,
            scheduler: self.scheduler,
            ema: ParameterEma::new(self.settings.ema_decay),
            settings: self.settings,
            parameters,
            pending_grads: None,
            log_sink: self
                .log_sink
                .unwrap_or_else(|| Box::new(NullSink) as Box<dyn LogSink>),
            checkpoint_sink: self
                .checkpoint_sink
                .unwrap_or_else(|| Box::new(SafetensorsCheckpoint) as Box<dyn CheckpointSink>),
            visualizer: self.visualizer,
            profiler,
        })
    }
}

/// Epoch loop over a multi-head model.
pub struct Trainer<M> {
    model: M,
    loss: MultiHeadLoss,
    optimizer: Box<dyn ParameterOptimizer>,
    scheduler: Option<Box<dyn LRScheduler>>,
    settings: TrainerSettings,
    ema: ParameterEma,
    /// Model variables in `PoseModel::parameters` order.
    parameters: Vec<Var>,
    /// Gradients summed since the last optimizer step.
    pending_grads: Option<GradStore>,
    log_sink: Box<dyn LogSink>,
    checkpoint_sink: Box<dyn CheckpointSink>,
    visualizer: Option<Box<dyn EncoderVisualizer>>,
    profiler: Option<BatchProfiler>,
}

impl<M: PoseModel> Trainer<M> {
    pub fn builder(model: M, loss: MultiHeadLoss, settings: TrainerSettings) -> TrainerBuilder<M> {
        TrainerBuilder {
            model,
            loss,
            settings,
            optimizer: None,
            optimizer_config: OptimizerConfig::default(),
            scheduler: None,
            log_sink: None,
            checkpoint_sink: None,
            visualizer: None,
        }
    }

    /// Wires a trainer entirely from a configuration file's contents: optimizer
    /// and schedule from their sections, a [`Logger`] for records and the
    /// safetensors checkpoint format.
    pub fn from_config(
        model: M,
        heads: Vec<Box<dyn HeadLoss>>,
        config: &TrainingConfig,
    ) -> Result<Self, TrainingError> {
        config.validate()?;

        let settings = TrainerSettings::from_config(config)?;
        let loss = MultiHeadLoss::new(heads, config.lambdas.clone())?;
        let logger = Logger::new(LoggingSettings::from_config(&config.logging))?;

        let mut builder = Trainer::builder(model, loss, settings)
            .optimizer_config(config.optimizer.clone())
            .log_sink(logger);
        if let Some(schedule) = scheduler::SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            config.epochs,
        )? {
            builder = builder.scheduler(schedule.build());
        }
        builder.build()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn settings(&self) -> &TrainerSettings {
        &self.settings
    }

    pub fn ema(&self) -> &ParameterEma {
        &self.ema
    }

    /// Learning rate currently set on the optimizer.
    pub fn lr(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn has_pending_gradients(&self) -> bool {
        self.pending_grads.is_some()
    }

    /// Evaluates the loss heads on the model outputs.
    pub fn combined_loss(
        &self,
        outputs: &[Tensor],
        targets: &[Vec<Tensor>],
    ) -> Result<CombinedLoss, TrainingError> {
        self.loss.compute(outputs, targets)
    }

    /// Forward and backward pass on one batch. Gradients are added to the
    /// pending ones; with `apply_gradients` the optimizer then steps, the
    /// pending gradients are dropped and the EMA follows.
    pub fn train_batch(
        &mut self,
        batch: &SceneBatch,
        apply_gradients: bool,
    ) -> Result<LossValues, TrainingError> {
        match self.profiler.take() {
            Some(mut profiler) => {
                profiler.begin_batch();
                let result = self.run_train_batch(Some(&mut profiler), batch, apply_gradients);
                let finished = profiler.finish_batch();
                self.profiler = Some(profiler);
                let values = result?;
                finished?;
                Ok(values)
            }
            None => self.run_train_batch(None, batch, apply_gradients),
        }
    }

    fn run_train_batch(
        &mut self,
        mut profiler: Option<&mut BatchProfiler>,
        batch: &SceneBatch,
        apply_gradients: bool,
    ) -> Result<LossValues, TrainingError> {
        timed(&mut profiler, BatchPhase::Visualize, || {
            if let Some(visualizer) = self.visualizer.as_mut() {
                visualizer.visualize(&batch.data, &batch.targets, &batch.meta);
            }
        });

        let (data, targets) = timed(&mut profiler, BatchPhase::Transfer, || self.transfer(batch))?;
        let outputs = timed(&mut profiler, BatchPhase::Forward, || self.model.forward(&data))?;
        let combined = timed(&mut profiler, BatchPhase::Loss, || {
            self.combined_loss(&outputs, &targets)
        })?;

        timed(&mut profiler, BatchPhase::Backward, || -> Result<(), TrainingError> {
            if let Some(total) = combined.total.as_ref() {
                let grads = total.backward()?;
                self.accumulate_gradients(grads)?;
            }
            Ok(())
        })?;

        if apply_gradients {
            timed(&mut profiler, BatchPhase::Optimizer, || self.apply_gradients())?;
        }

        combined.values()
    }

    /// Forward pass without gradient bookkeeping.
    pub fn val_batch(&self, batch: &SceneBatch) -> Result<LossValues, TrainingError> {
        let (data, targets) = self.transfer(batch)?;
        let outputs = self
            .model
            .forward(&data)?
            .into_iter()
            .map(|output| output.detach())
            .collect::<Vec<_>>();
        self.combined_loss(&outputs, &targets)?.values()
    }

    pub fn step_ema(&mut self) -> Result<(), TrainingError> {
        self.ema.step(&self.parameters)
    }

    pub fn apply_ema(&mut self) -> Result<(), TrainingError> {
        self.ema.apply(&self.parameters)
    }

    pub fn restore_ema(&mut self) -> Result<(), TrainingError> {
        self.ema.restore(&self.parameters)
    }

    pub fn train_epoch(
        &mut self,
        loader: &mut dyn DataLoader,
        epoch: usize,
    ) -> Result<(), TrainingError> {
        let n_batches = loader.num_batches();
        if n_batches == 0 {
            return Err(TrainingError::EmptyDataset("training"));
        }
        let mut clock = BatchClock::start();

        self.model.set_training(true);
        if self.settings.fix_batch_norm {
            let frozen = freeze_batch_norm(&mut self.model);
            log::debug!("froze {frozen} batch norm layer(s)");
        }
        self.restore_ema()?;
        self.ema.reset();

        log::info!("epoch {epoch}");
        if let Some(scheduler) = self.scheduler.as_mut() {
            let lr = scheduler.step();
            self.optimizer.set_learning_rate(lr);
        }

        let mut losses = EpochLosses::new(self.loss.lambdas().len());
        self.pending_grads = None;
        loader.reset()?;

        let mut batch_idx = 0;
        while let Some(batch) = loader.next_batch()? {
            let data_time = clock.begin_batch();
            let apply_gradients = batch_idx % self.settings.stride_apply == 0;
            let values = self.train_batch(&batch, apply_gradients)?;
            losses.record(&values);
            let batch_time = clock.batch_elapsed();

            if batch_idx % self.settings.log_interval == 0 {
                let record = LogRecord::Train(TrainBatchRecord {
                    epoch,
                    batch: batch_idx,
                    n_batches,
                    time: round_to(batch_time.as_secs_f64(), 3),
                    data_time: round_to(data_time.as_secs_f64(), 3),
                    lr: self.lr(),
                    loss: round_optional(values.total, 3),
                    head_losses: values
                        .heads
                        .iter()
                        .map(|loss| round_optional(*loss, 3))
                        .collect(),
                });
                self.log_sink.record(&record);
            }

            if self.ema.seed(&self.parameters)? {
                log::debug!("initialized ema shadow at batch {batch_idx}");
            }

            clock.end_batch();
            batch_idx += 1;
        }

        self.apply_ema()?;

        let (loss, head_losses) = losses.means(n_batches);
        self.log_sink.record(&LogRecord::TrainEpoch(EpochRecord {
            epoch: epoch + 1,
            loss: round_to(loss, 5),
            head_losses: head_losses.into_iter().map(|l| round_to(l, 5)).collect(),
            time: round_to(clock.epoch_elapsed().as_secs_f64(), 1),
        }));
        self.log_sink.flush();
        Ok(())
    }

    /// Validation pass. Runs on whatever parameters are live, so after a
    /// training epoch with EMA enabled it sees the shadow.
    pub fn val_epoch(
        &mut self,
        loader: &mut dyn DataLoader,
        epoch: usize,
    ) -> Result<(), TrainingError> {
        let n_batches = loader.num_batches();
        if n_batches == 0 {
            return Err(TrainingError::EmptyDataset("validation"));
        }
        let clock = BatchClock::start();
        self.model.set_training(false);

        let mut losses = EpochLosses::new(self.loss.lambdas().len());
        loader.reset()?;
        while let Some(batch) = loader.next_batch()? {
            let values = self.val_batch(&batch)?;
            losses.record(&values);
        }

        let (loss, head_losses) = losses.means(n_batches);
        self.log_sink.record(&LogRecord::ValEpoch(EpochRecord {
            epoch,
            loss: round_to(loss, 5),
            head_losses: head_losses.into_iter().map(|l| round_to(l, 5)).collect(),
            time: round_to(clock.epoch_elapsed().as_secs_f64(), 1),
        }));
        self.log_sink.flush();
        Ok(())
    }

    /// Writes host copies of the (unwrapped) model's parameters and returns
    /// the checkpoint path.
    pub fn write_checkpoint(
        &mut self,
        epoch: usize,
        is_final: bool,
    ) -> Result<PathBuf, TrainingError> {
        let model: &dyn PoseModel = match self.model.unwrap_data_parallel() {
            Some(inner) => {
                log::debug!("writing a data-parallel model");
                inner
            }
            None => {
                log::debug!("writing a single-device model");
                &self.model
            }
        };

        let parameters = model
            .parameters()
            .into_iter()
            .map(|(name, var)| Ok((name, host_copy(var.as_tensor())?)))
            .collect::<Result<Vec<_>, TrainingError>>()?;

        let path = checkpoint::checkpoint_path(&self.settings.output, epoch, is_final);
        let record = CheckpointRecord {
            parameters,
            epoch,
            meta: self.settings.model_meta.clone(),
        };
        log::debug!("about to write model to {}", path.display());
        self.checkpoint_sink.save(&path, &record)?;
        log::debug!("model written");
        Ok(path)
    }

    /// Trains epochs `start_epoch..epochs`, checkpointing and validating
    /// after each one.
    pub fn run_loop(
        &mut self,
        train: &mut dyn DataLoader,
        val: &mut dyn DataLoader,
        epochs: usize,
        start_epoch: usize,
    ) -> Result<(), TrainingError> {
        if let Some(scheduler) = self.scheduler.as_mut() {
            for _ in 0..start_epoch {
                scheduler.step();
            }
            self.optimizer.set_learning_rate(scheduler.learning_rate());
        }
        if start_epoch >= epochs {
            log::info!("start epoch {start_epoch} is past the last epoch {epochs}; nothing to train");
        }

        for epoch in start_epoch..epochs {
            self.train_epoch(train, epoch)?;
            self.write_checkpoint(epoch + 1, epoch == epochs - 1)?;
            self.val_epoch(val, epoch + 1)?;
        }

        self.log_sink.flush();
        Ok(())
    }

    /// Runs the configured number of epochs, resuming first when the settings
    /// name a checkpoint.
    pub fn fit(
        &mut self,
        train: &mut dyn DataLoader,
        val: &mut dyn DataLoader,
    ) -> Result<(), TrainingError> {
        let start_epoch = match self.settings.resume.clone() {
            Some(path) => self.resume_from(&path)?,
            None => 0,
        };
        let epochs = self.settings.epochs;
        self.run_loop(train, val, epochs, start_epoch)
    }

    /// Loads the checkpoint at `path` into the model and returns its epoch.
    pub fn resume_from(&mut self, path: &Path) -> Result<usize, TrainingError> {
        let loaded = checkpoint::load_checkpoint(path)?;
        let model: &dyn PoseModel = match self.model.unwrap_data_parallel() {
            Some(inner) => inner,
            None => &self.model,
        };
        checkpoint::apply_model_weights(model, &loaded.model_weights_path)?;
        log::info!(
            "resumed from {} at epoch {}",
            path.display(),
            loaded.manifest.epoch
        );
        Ok(loaded.manifest.epoch)
    }

    fn transfer(&self, batch: &SceneBatch) -> Result<(Tensor, Vec<Vec<Tensor>>), TrainingError> {
        match self.settings.device.as_ref() {
            Some(device) => batch.to_device(device),
            None => Ok((batch.data.clone(), batch.targets.clone())),
        }
    }

    fn accumulate_gradients(&mut self, grads: GradStore) -> Result<(), TrainingError> {
        match self.pending_grads.as_mut() {
            Some(pending) => merge_gradient_store(&self.parameters, pending, grads),
            None => {
                self.pending_grads = Some(grads);
                Ok(())
            }
        }
    }

    fn apply_gradients(&mut self) -> Result<(), TrainingError> {
        match self.pending_grads.take() {
            Some(grads) => self.optimizer.step(&grads)?,
            None => log::debug!("no gradients to apply"),
        }
        self.step_ema()
    }
}

fn timed<R>(
    profiler: &mut Option<&mut BatchProfiler>,
    phase: BatchPhase,
    f: impl FnOnce() -> R,
) -> R {
    match profiler {
        Some(profiler) => profiler.span(phase, f),
        None => f(),
    }
}

/// Adds every parameter gradient in `new_grads` into `accum`. Gradients of
/// intermediate tensors are dropped.
fn merge_gradient_store(
    parameters: &[Var],
    accum: &mut GradStore,
    mut new_grads: GradStore,
) -> Result<(), TrainingError> {
    for var in parameters {
        let tensor = var.as_tensor();
        if let Some(grad) = new_grads.remove(tensor) {
            let combined = match accum.remove(tensor) {
                Some(existing) => existing.add(&grad)?,
                None => grad,
            };
            accum.insert(tensor, combined);
        }
    }
    Ok(())
}

/// Deep copy on the CPU, independent of later in-place updates.
fn host_copy(tensor: &Tensor) -> Result<Tensor, TrainingError> {
    let tensor = tensor.detach();
    let host = if tensor.device().is_cpu() {
        tensor.copy()?
    } else {
        tensor.to_device(&Device::Cpu)?
    };
    Ok(host)
}
