//! Error types for the tuner engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TunerError>;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Invalid experiment configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Experiment not found: {0}")]
    ExperimentNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
