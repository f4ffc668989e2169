//! Harness error type.

use rollguard_engine::DetectorError;
use rollguard_engine::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("engine: {0}")]
    Detector(#[from] DetectorError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("invalid option value '{value}' for {option}")]
    InvalidOption { option: &'static str, value: String },
    #[error("{failed} of {total} scenarios failed")]
    SuiteFailed { failed: usize, total: usize },
    #[error("log has {0} schema violations")]
    LogInvalid(usize),
}
