use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::Serialize;

use crate::{config::LoggingConfig, TrainingError};

/// Structured record emitted by the training loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogRecord {
    Train(TrainBatchRecord),
    TrainEpoch(EpochRecord),
    ValEpoch(EpochRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainBatchRecord {
    pub epoch: usize,
    pub batch: usize,
    pub n_batches: usize,
    /// Seconds spent inside the batch.
    pub time: f64,
    /// Seconds spent waiting for the loader before the batch.
    pub data_time: f64,
    pub lr: f64,
    pub loss: Option<f64>,
    pub head_losses: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub loss: f64,
    pub head_losses: Vec<f64>,
    pub time: f64,
}

/// Destination for [`LogRecord`]s. Sinks must not fail the training run;
/// write problems are reported through the `log` facade instead.
pub trait LogSink {
    fn record(&mut self, record: &LogRecord);

    fn flush(&mut self) {}
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&mut self, _record: &LogRecord) {}
}

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub json_lines: Option<PathBuf>,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl LoggingSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            json_lines: config.json_lines.clone(),
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

/// Default sink: JSON lines on stdout and/or a file, plus TensorBoard scalars.
pub struct Logger {
    settings: LoggingSettings,
    json_lines: Option<BufWriter<File>>,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let json_lines = match settings.json_lines.as_ref() {
            Some(path) => Some(open_json_lines(path)?),
            None => None,
        };
        let tensorboard = match settings.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                settings.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            settings,
            json_lines,
            tensorboard,
        })
    }

    fn write_scalars(&mut self, record: &LogRecord) -> Result<(), TrainingError> {
        let Some(writer) = self.tensorboard.as_mut() else {
            return Ok(());
        };
        match record {
            LogRecord::Train(batch) => {
                let step = (batch.epoch * batch.n_batches + batch.batch) as i64;
                writer.write_scalar("train/learning_rate", step, batch.lr)?;
                if let Some(loss) = batch.loss {
                    writer.write_scalar("train/loss", step, loss)?;
                }
                for (index, loss) in batch.head_losses.iter().enumerate() {
                    if let Some(loss) = loss {
                        writer.write_scalar(&format!("train/head_{index}"), step, *loss)?;
                    }
                }
            }
            LogRecord::TrainEpoch(epoch) => write_epoch(writer, "train-epoch", epoch)?,
            LogRecord::ValEpoch(epoch) => write_epoch(writer, "val-epoch", epoch)?,
        }
        Ok(())
    }
}

impl LogSink for Logger {
    fn record(&mut self, record: &LogRecord) {
        let line = match serde_json::to_string(record) {
            Ok(line) => line,
            Err(err) => {
                log::warn!("failed to serialize log record: {err}");
                return;
            }
        };

        if self.settings.enable_stdout {
            println!("{line}");
        }

        if let Some(file) = self.json_lines.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                log::warn!("failed to append log record: {err}");
            }
        }

        if let Err(err) = self.write_scalars(record) {
            log::warn!("{err}");
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.json_lines.as_mut() {
            if let Err(err) = file.flush() {
                log::warn!("failed to flush log records: {err}");
            }
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!("{err}");
            }
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        LogSink::flush(self);
    }
}

fn write_epoch(
    writer: &mut TensorBoardWriter,
    prefix: &str,
    record: &EpochRecord,
) -> Result<(), TrainingError> {
    let step = record.epoch as i64;
    writer.write_scalar(&format!("{prefix}/loss"), step, record.loss)?;
    writer.write_scalar(&format!("{prefix}/time"), step, record.time)?;
    for (index, loss) in record.head_losses.iter().enumerate() {
        writer.write_scalar(&format!("{prefix}/head_{index}"), step, *loss)?;
    }
    Ok(())
}

fn open_json_lines(path: &Path) -> Result<BufWriter<File>, TrainingError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create log directory {}: {err}",
                parent.display()
            ))
        })?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to open log file {}: {err}",
                path.display()
            ))
        })?;
    Ok(BufWriter::new(file))
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let data = buffer.freeze();

        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::warn!("{err}");
        }
    }
}

/// TFRecord framing checksum.
fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
