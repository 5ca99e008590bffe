//! Executor error types.

use atlas_core::{RiskCode, Severity};
use atlas_risk::RiskError;
use atlas_store::StoreError;
use atlas_strategy::StrategyError;
use thiserror::Error;

/// Broker call failures.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Order rejected: {0}")]
    Rejected(String),

    #[error("Venue unavailable in this region: {0}")]
    GeoBlocked(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Whether a retry with the same client order id may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_) | Self::RateLimited)
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Rejected(_) => "rejected",
            Self::GeoBlocked(_) => "geo_blocked",
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
            Self::Decode(_) => "decode",
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Risk denied ({code}): {message}")]
    RiskDenied {
        code: RiskCode,
        severity: Severity,
        message: String,
    },

    #[error("Position {0} is already closed")]
    PositionClosed(String),

    #[error("No reference price for {0}")]
    NoReferencePrice(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Risk error: {0}")]
    Risk(#[from] RiskError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;
