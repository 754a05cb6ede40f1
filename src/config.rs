use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::{device::DevicePreference, TrainingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Final checkpoint path; per-epoch checkpoints append `.epochNNN`.
    pub output: PathBuf,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// One weight per sub-loss, in head order.
    pub lambdas: Vec<f64>,
    /// Checkpoint to resume from; its epoch becomes the start epoch.
    #[serde(default)]
    pub resume: Option<PathBuf>,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::load_with_overrides(path, &[])
    }

    /// Loads `path`, applies `overrides`, then resolves relative paths
    /// against the config file's directory, so overridden paths resolve
    /// the same way as paths written in the file.
    pub fn load_with_overrides(
        path: impl AsRef<Path>,
        overrides: &[ConfigOverride],
    ) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let mut config = Self::read_file(path)?.overridden(overrides)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, TrainingError> {
        let contents = fs::read_to_string(path)?;
        let config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.output.as_os_str().is_empty() {
            errors.push("output must not be empty".to_string());
        }

        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }

        if self.lambdas.is_empty() {
            errors.push("lambdas must not be empty".to_string());
        }
        if self.lambdas.iter().any(|lambda| !lambda.is_finite()) {
            errors.push("lambdas must be finite".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        let scheduler = &self.scheduler;
        if !(0.0 < scheduler.decay_factor && scheduler.decay_factor <= 1.0) {
            errors.push("scheduler.decay_factor must be in (0, 1]".to_string());
        }
        if !(0.0 < scheduler.warm_up_factor && scheduler.warm_up_factor <= 1.0) {
            errors.push("scheduler.warm_up_factor must be in (0, 1]".to_string());
        }
        if scheduler.decay_epochs.windows(2).any(|pair| pair[0] > pair[1]) {
            errors.push("scheduler.decay_epochs must be sorted".to_string());
        }
        if let Some(min_lr) = scheduler.min_lr {
            if min_lr < 0.0 {
                errors.push("scheduler.min_lr must be >= 0".to_string());
            }
            if min_lr > self.optimizer.learning_rate {
                errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
            }
        }
        if scheduler.power <= 0.0 {
            errors.push("scheduler.power must be greater than 0".to_string());
        }

        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.stride_apply == 0 {
            errors.push("runtime.stride_apply must be greater than 0".to_string());
        }
        if let Some(decay) = self.runtime.ema_decay {
            if !(0.0 < decay && decay <= 1.0) {
                errors.push("runtime.ema_decay must be in (0, 1]".to_string());
            }
        }

        if self.logging.tensorboard_flush_every_n == 0 {
            errors.push("logging.tensorboard_flush_every_n must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.output, base);
        if let Some(path) = self.resume.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.runtime.profile.as_mut() {
            absolutize_in_place(path, base);
        }
        for path in [
            self.logging.json_lines.as_mut(),
            self.logging.tensorboard.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Sgd,
    Adam,
    #[serde(alias = "adamw")]
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    /// Epochs at which `multi_step` multiplies the rate by `decay_factor`.
    #[serde(default)]
    pub decay_epochs: Vec<usize>,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    #[serde(default)]
    pub warm_up_epochs: usize,
    #[serde(default = "default_warm_up_factor")]
    pub warm_up_factor: f64,
    #[serde(default)]
    pub min_lr: Option<f64>,
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: LearningRateSchedule::default(),
            decay_epochs: Vec::new(),
            decay_factor: default_decay_factor(),
            warm_up_epochs: 0,
            warm_up_factor: default_warm_up_factor(),
            min_lr: None,
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    /// No scheduler is attached to the trainer.
    #[serde(alias = "none")]
    Disabled,
    Constant,
    #[default]
    MultiStep,
    Cosine,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_stride_apply")]
    pub stride_apply: usize,
    #[serde(default)]
    pub ema_decay: Option<f64>,
    #[serde(default)]
    pub fix_batch_norm: bool,
    /// Chrome trace destination; enables the profiled train-batch path.
    #[serde(default)]
    pub profile: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::default(),
            log_interval: default_log_interval(),
            stride_apply: default_stride_apply(),
            ema_decay: None,
            fix_batch_norm: false,
            profile: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_enable_stdout")]
    pub enable_stdout: bool,
    /// Append every record as one JSON object per line.
    #[serde(default)]
    pub json_lines: Option<PathBuf>,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: default_enable_stdout(),
            json_lines: None,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

/// `key.path=value` assignment applied on top of a loaded configuration.
/// Segments may index arrays, as in `scheduler.decay_epochs[1]=60`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigOverride {
    pub path: String,
    pub value: String,
}

impl FromStr for ConfigOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl TrainingConfig {
    /// Applies `overrides` in order and validates the result. Paths are
    /// taken as given; use [`TrainingConfig::load_with_overrides`] to
    /// resolve them against a config file.
    pub fn with_overrides(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        let config = self.overridden(overrides)?;
        config.validate()?;
        Ok(config)
    }

    fn overridden(self, overrides: &[ConfigOverride]) -> Result<Self, TrainingError> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut value = serde_json::to_value(self)?;
        for entry in overrides {
            let segments = parse_path(&entry.path)?;
            assign_at_path(&mut value, &segments, parse_override_value(&entry.value))?;
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((key, index)) => {
                let index = index.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::validation(vec![format!(
                        "invalid index in override path '{segment}': {err}"
                    )])
                })?;
                Ok(PathSegment {
                    key: key.to_string(),
                    index: Some(index),
                })
            }
            None if segment.is_empty() => Err(TrainingError::validation(vec![format!(
                "empty segment in override path '{path}'"
            )])),
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return Err(TrainingError::validation(vec![format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        )]));
    };

    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);
    let slot = match segment.index {
        Some(index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let Value::Array(items) = entry else {
                return Err(TrainingError::validation(vec![format!(
                    "override path segment '{}' expects an array",
                    segment.key
                )]));
            };
            match index.cmp(&items.len()) {
                Ordering::Less => {}
                Ordering::Equal => items.push(Value::Null),
                Ordering::Greater => {
                    return Err(TrainingError::validation(vec![format!(
                        "override index {index} for '{}' is past the end (length {})",
                        segment.key,
                        items.len()
                    )]));
                }
            }
            &mut items[index]
        }
        None => entry,
    };
    assign_at_path(slot, rest, new_value)
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_epochs() -> usize {
    75
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_decay_factor() -> f64 {
    0.1
}

fn default_warm_up_factor() -> f64 {
    0.001
}

fn default_power() -> f64 {
    1.0
}

fn default_log_interval() -> usize {
    10
}

fn default_stride_apply() -> usize {
    1
}

fn default_enable_stdout() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
output = "outputs/model.ckpt"
lambdas = [1.0, 1.0, 0.2]

[runtime]
stride_apply = 2
ema_decay = 0.001
"#
    }

    #[test]
    fn toml_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(&path, minimal_toml()).unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.output, dir.path().join("outputs/model.ckpt"));
        assert_eq!(config.epochs, 75);
        assert_eq!(config.runtime.stride_apply, 2);
        assert_eq!(config.runtime.log_interval, 10);
        assert_eq!(config.runtime.ema_decay, Some(0.001));
        assert_eq!(config.optimizer.algorithm, OptimizerType::Sgd);
        assert_eq!(config.scheduler.strategy, LearningRateSchedule::MultiStep);
    }

    #[test]
    fn json_config_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        fs::write(
            &path,
            r#"{"output": "/tmp/out", "lambdas": [1.0], "epochs": 3,
                "optimizer": {"algorithm": "adam_w", "learning_rate": 0.01}}"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.output, PathBuf::from("/tmp/out"));
        assert_eq!(config.epochs, 3);
        assert_eq!(config.optimizer.algorithm, OptimizerType::AdamW);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        fs::write(&path, "output: x").unwrap();
        assert!(matches!(
            TrainingConfig::load(&path),
            Err(TrainingError::ConfigFormat(_))
        ));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        config.lambdas.clear();
        config.runtime.stride_apply = 0;
        config.runtime.ema_decay = Some(1.5);

        let Err(TrainingError::Validation(errors)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(errors.len(), 3, "{errors:?}");
    }

    #[test]
    fn overrides_follow_dotted_and_indexed_paths() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        let overrides: Vec<ConfigOverride> = [
            "epochs=3",
            "optimizer.algorithm=adam",
            "scheduler.decay_epochs=[10, 20]",
            "scheduler.decay_epochs[1]=30",
            "runtime.fix_batch_norm=true",
            "runtime.ema_decay=null",
        ]
        .iter()
        .map(|raw| raw.parse().unwrap())
        .collect();

        let config = config.with_overrides(&overrides).unwrap();
        assert_eq!(config.epochs, 3);
        assert_eq!(config.optimizer.algorithm, OptimizerType::Adam);
        assert_eq!(config.scheduler.decay_epochs, vec![10, 30]);
        assert!(config.runtime.fix_batch_norm);
        assert_eq!(config.runtime.ema_decay, None);
    }

    #[test]
    fn overrides_are_validated() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        let overrides = vec!["runtime.log_interval=0".parse::<ConfigOverride>().unwrap()];
        assert!(matches!(
            config.with_overrides(&overrides),
            Err(TrainingError::Validation(_))
        ));
        assert!("no-equals-sign".parse::<ConfigOverride>().is_err());
    }

    #[test]
    fn override_indices_may_only_append() {
        let config: TrainingConfig = toml::from_str(minimal_toml()).unwrap();
        let appended = config
            .clone()
            .with_overrides(&["scheduler.decay_epochs[0]=40".parse().unwrap()])
            .unwrap();
        assert_eq!(appended.scheduler.decay_epochs, vec![40]);

        for raw in [
            "scheduler.decay_epochs[18446744073709551615]=1",
            "scheduler.decay_epochs[100000000000]=1",
            "lambdas[4]=1.0",
        ] {
            let result = config.clone().with_overrides(&[raw.parse().unwrap()]);
            assert!(
                matches!(result, Err(TrainingError::Validation(_))),
                "{raw}: {result:?}"
            );
        }
    }

    #[test]
    fn overridden_paths_resolve_against_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(&path, minimal_toml()).unwrap();

        let overrides: Vec<ConfigOverride> = ["output=runs/other.ckpt", "resume=/abs/model.ckpt"]
            .iter()
            .map(|raw| raw.parse().unwrap())
            .collect();
        let config = TrainingConfig::load_with_overrides(&path, &overrides).unwrap();
        assert_eq!(config.output, dir.path().join("runs/other.ckpt"));
        assert_eq!(config.resume, Some(PathBuf::from("/abs/model.ckpt")));
    }
}
