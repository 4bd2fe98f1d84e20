//! Engine error taxonomy
//!
//! Expected conditions (insufficient data, rate limits, untrained model) are
//! variants here so callers can decide to skip, retry or fail closed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient data: need {required} samples, got {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("rate limited by market data source: {0}")]
    RateLimited(String),

    #[error("market data unavailable: {0}")]
    Unavailable(String),

    #[error("order failed for {instrument}: {reason}")]
    OrderFailed { instrument: String, reason: String },

    #[error("no trained model installed")]
    ModelNotTrained,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("inconsistent model bundle: {0}")]
    ModelBundle(String),

    #[error("trading halted by risk governor: {0}")]
    Halted(String),

    #[error("training failed: {0}")]
    Training(String),

    #[error("{0} holds an open position")]
    PositionOpen(String),

    #[error("{0} already running")]
    AlreadyRunning(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Transient market data failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::RateLimited(_) | EngineError::Unavailable(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
