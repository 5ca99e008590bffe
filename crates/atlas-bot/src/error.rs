//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] atlas_ws::WsError),

    #[error("Store error: {0}")]
    Store(#[from] atlas_store::StoreError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] atlas_strategy::StrategyError),

    #[error("Broker error: {0}")]
    Broker(#[from] atlas_executor::BrokerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] atlas_telemetry::TelemetryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
