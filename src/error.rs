use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    /// Model outputs, loss heads and target groups disagree in length.
    #[error("head count mismatch: {heads} loss heads, {outputs} model outputs, {targets} target groups")]
    HeadCount {
        heads: usize,
        outputs: usize,
        targets: usize,
    },

    /// The lambda vector does not line up with the flattened sub-losses.
    #[error("loss arity mismatch: {lambdas} lambdas for {sub_losses} sub-losses")]
    LossArity { lambdas: usize, sub_losses: usize },

    #[error("{0} dataset produced no batches")]
    EmptyDataset(&'static str),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}
