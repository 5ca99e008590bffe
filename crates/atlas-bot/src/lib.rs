//! Atlas trading engine.
//!
//! Wires the market stream into the snapshot cache, runs one evaluation
//! loop per configured strategy and executes the resulting intents
//! through the broker pipeline with paper fallback.

pub mod app;
pub mod config;
pub mod error;
pub mod metrics_server;
pub mod momentum;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
