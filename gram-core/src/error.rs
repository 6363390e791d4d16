use thiserror::Error;

#[derive(Debug, Error)]
pub enum GramError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown algorithm `{0}`, expected one of gram, robust_rl, contextual_rl, domain_rand, gram_separate, gram_modular")]
    UnknownAlgorithm(String),

    #[error("invalid range for {name}: min {min} is greater than max {max}")]
    InvalidRange { name: String, min: f32, max: f32 },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("rollout storage overflow: horizon of {horizon} steps already filled")]
    StorageOverflow { horizon: usize },

    #[error("rollout storage underfilled: {filled} of {horizon} steps recorded")]
    StorageUnderfilled { filled: usize, horizon: usize },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("environment error: {0}")]
    Environment(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GramError>;
