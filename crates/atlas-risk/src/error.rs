//! Risk error types.

use atlas_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Risk state unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type RiskResult<T> = Result<T, RiskError>;
