pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod ema;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod profile;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointRecord, CheckpointSink, SafetensorsCheckpoint};
pub use config::TrainingConfig;
pub use data::{DataLoader, InMemoryLoader, SceneBatch};
pub use device::DevicePreference;
pub use ema::ParameterEma;
pub use error::{Result, TrainingError};
pub use logging::{LogRecord, LogSink, Logger, LoggingSettings};
pub use loss::{HeadLoss, LossValues, MultiHeadLoss};
pub use model::{BatchNormLayer, PoseModel};
pub use optimizer::{build_optimizer, ParameterOptimizer};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use trainer::{EncoderVisualizer, Trainer, TrainerBuilder, TrainerSettings};
