use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Tch(#[from] tch::TchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The score function returned a tensor that does not match the sample.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<i64>, actual: Vec<i64> },

    #[error("loss became non-finite during epoch {epoch}")]
    NonFiniteLoss { epoch: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
