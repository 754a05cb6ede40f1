use candle_core::{Device, Tensor};
use serde_json::Value;

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One batch of images with their per-head targets.
#[derive(Debug, Clone)]
pub struct SceneBatch {
    pub data: Tensor,
    /// `targets[h]` is the target group consumed by head `h`.
    pub targets: Vec<Vec<Tensor>>,
    /// Per-image annotations forwarded to the encoder visualizer.
    pub meta: Vec<Value>,
}

impl SceneBatch {
    pub fn new(data: Tensor, targets: Vec<Vec<Tensor>>) -> Self {
        Self {
            data,
            targets,
            meta: Vec::new(),
        }
    }

    pub fn with_meta(mut self, meta: Vec<Value>) -> Self {
        self.meta = meta;
        self
    }

    /// Copies the input and every target onto `device`.
    pub fn to_device(&self, device: &Device) -> Result<(Tensor, Vec<Vec<Tensor>>)> {
        let data = self.data.to_device(device)?;
        let targets = self
            .targets
            .iter()
            .map(|head| {
                head.iter()
                    .map(|target| target.to_device(device))
                    .collect::<candle_core::Result<Vec<_>>>()
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok((data, targets))
    }
}

/// Finite, re-iterable source of batches. The trainer calls
/// [`DataLoader::reset`] before every pass.
pub trait DataLoader {
    /// Number of batches one pass yields.
    fn num_batches(&self) -> usize;

    fn reset(&mut self) -> Result<()>;

    fn next_batch(&mut self) -> Result<Option<SceneBatch>>;
}

/// Loader over batches already held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    batches: Vec<SceneBatch>,
    cursor: usize,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<SceneBatch>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataLoader for InMemoryLoader {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<SceneBatch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}
