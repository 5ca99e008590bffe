//! Strategy error types.

use atlas_core::StrategyState;
use atlas_risk::RiskError;
use atlas_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Invalid transition {current} -> {requested} (allowed: {allowed:?})")]
    InvalidTransition {
        current: StrategyState,
        requested: StrategyState,
        allowed: Vec<StrategyState>,
    },

    #[error("State conflict: expected {expected}, found {actual}")]
    StateConflict {
        expected: StrategyState,
        actual: StrategyState,
    },

    #[error("Strategy {0} is disabled")]
    Disabled(String),

    #[error("Strategy not found: {0}")]
    NotFound(String),

    #[error("Decision agent failed: {0}")]
    Agent(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),
}

pub type StrategyResult<T> = Result<T, StrategyError>;
