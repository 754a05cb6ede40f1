//! Checkpoint naming, the sink contract and the default on-disk format.
//!
//! A checkpoint written by [`SafetensorsCheckpoint`] is a directory:
//!
//! ```text
//! <path>/model.safetensors   host tensors keyed by parameter name
//! <path>/manifest.json       version, epoch, model metadata, file checksum
//! ```

use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{model::PoseModel, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Destination of a checkpoint: `output` itself for the final one, otherwise
/// `output` with an `.epochNNN` suffix.
pub fn checkpoint_path(output: &Path, epoch: usize, is_final: bool) -> PathBuf {
    if is_final {
        return output.to_path_buf();
    }
    let mut name = OsString::from(output.as_os_str());
    name.push(format!(".epoch{epoch:03}"));
    PathBuf::from(name)
}

/// What the trainer hands to a [`CheckpointSink`].
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Host copies of the parameters, in model order.
    pub parameters: Vec<(String, Tensor)>,
    pub epoch: usize,
    pub meta: Value,
}

/// Persists checkpoint records.
pub trait CheckpointSink {
    fn save(&mut self, path: &Path, record: &CheckpointRecord) -> Result<(), TrainingError>;
}

/// Writes the safetensors + manifest directory format.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetensorsCheckpoint;

impl CheckpointSink for SafetensorsCheckpoint {
    fn save(&mut self, path: &Path, record: &CheckpointRecord) -> Result<(), TrainingError> {
        let manifest = save_checkpoint(path, record)?;
        log::info!(
            "saved checkpoint for epoch {} to {} ({} parameters)",
            manifest.epoch,
            path.display(),
            manifest.parameters
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    #[serde(default)]
    pub meta: Value,
    pub parameters: usize,
    pub model: FileRecord,
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub model_weights_path: PathBuf,
}

/// Writes `record` as a checkpoint directory at `path`, replacing whatever
/// was there.
pub fn save_checkpoint(
    path: &Path,
    record: &CheckpointRecord,
) -> Result<CheckpointManifest, TrainingError> {
    if record.parameters.is_empty() {
        return Err(TrainingError::checkpoint(
            "model contains no parameters to checkpoint",
        ));
    }

    if path.exists() {
        let removed = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.map_err(|err| {
            TrainingError::checkpoint(format!(
                "failed to remove existing checkpoint {}: {err}",
                path.display()
            ))
        })?;
    }
    fs::create_dir_all(path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to create checkpoint directory {}: {err}",
            path.display()
        ))
    })?;

    let model_path = path.join(MODEL_FILENAME);
    let tensors: HashMap<String, Tensor> = record.parameters.iter().cloned().collect();
    if tensors.len() != record.parameters.len() {
        return Err(TrainingError::checkpoint("duplicate parameter names"));
    }
    candle_core::safetensors::save(&tensors, &model_path).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to serialize model weights to {}: {err}",
            model_path.display()
        ))
    })?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        epoch: record.epoch,
        meta: record.meta.clone(),
        parameters: record.parameters.len(),
        model: file_record(&model_path)?,
    };
    write_json(&path.join(MANIFEST_FILENAME), &manifest)?;
    Ok(manifest)
}

/// Reads the manifest at `directory` and verifies the weights file against it.
pub fn load_checkpoint(directory: &Path) -> Result<LoadedCheckpoint, TrainingError> {
    let manifest = load_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    Ok(LoadedCheckpoint {
        manifest,
        model_weights_path: model_path,
    })
}

/// Copies the stored tensors into the model's variables. Every parameter
/// must be present and every stored tensor must be used.
pub fn apply_model_weights(model: &dyn PoseModel, weights_path: &Path) -> Result<(), TrainingError> {
    let parameters = model.parameters();
    let device = parameters
        .first()
        .map(|(_, var)| var.as_tensor().device().clone())
        .unwrap_or(Device::Cpu);
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::checkpoint(format!(
            "failed to read weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in parameters {
        let tensor = by_name
            .remove(&name)
            .ok_or_else(|| TrainingError::checkpoint(format!("checkpoint missing parameter {name}")))?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype)?
        };
        var.set(&tensor)?;
    }

    if !by_name.is_empty() {
        let mut extra = by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::checkpoint(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to stat {}: {err}", path.display()))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::checkpoint(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::checkpoint(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if sha256_file(path)? != expected_sha {
        return Err(TrainingError::checkpoint(format!(
            "{} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::checkpoint(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::checkpoint(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| {
            TrainingError::checkpoint(format!("failed to write {}: {err}", path.display()))
        })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::checkpoint(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::checkpoint(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(epoch: usize) -> CheckpointRecord {
        CheckpointRecord {
            parameters: vec![
                (
                    "head.weight".to_string(),
                    Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
                ),
                (
                    "head.bias".to_string(),
                    Tensor::new(&[0.5f32], &Device::Cpu).unwrap(),
                ),
            ],
            epoch,
            meta: json!({"heads": ["cif", "caf"]}),
        }
    }

    #[test]
    fn per_epoch_paths_carry_a_zero_padded_suffix() {
        let output = Path::new("outputs/resnet50.pkl");
        assert_eq!(
            checkpoint_path(output, 7, false),
            PathBuf::from("outputs/resnet50.pkl.epoch007")
        );
        assert_eq!(
            checkpoint_path(output, 1234, false),
            PathBuf::from("outputs/resnet50.pkl.epoch1234")
        );
        assert_eq!(checkpoint_path(output, 7, true), output);
    }

    #[test]
    fn saved_checkpoint_loads_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        SafetensorsCheckpoint.save(&path, &record(3)).unwrap();

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.manifest.epoch, 3);
        assert_eq!(loaded.manifest.parameters, 2);
        assert_eq!(loaded.manifest.meta["heads"][1], "caf");
        assert!(loaded.model_weights_path.is_file());
    }

    #[test]
    fn existing_checkpoint_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        SafetensorsCheckpoint.save(&path, &record(1)).unwrap();
        fs::write(path.join("stale.txt"), "old").unwrap();
        SafetensorsCheckpoint.save(&path, &record(2)).unwrap();

        assert!(!path.join("stale.txt").exists());
        assert_eq!(load_checkpoint(&path).unwrap().manifest.epoch, 2);
    }

    #[test]
    fn tampered_weights_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        SafetensorsCheckpoint.save(&path, &record(1)).unwrap();

        let weights = path.join(MODEL_FILENAME);
        let mut bytes = fs::read(&weights).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&weights, bytes).unwrap();

        assert!(matches!(
            load_checkpoint(&path),
            Err(TrainingError::Checkpoint(_))
        ));
    }

    #[test]
    fn empty_records_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let empty = CheckpointRecord {
            parameters: Vec::new(),
            epoch: 0,
            meta: Value::Null,
        };
        assert!(save_checkpoint(&dir.path().join("x"), &empty).is_err());
    }
}
