//! Prometheus metrics and structured logging for Atlas.
//!
//! - Structured logging with tracing (JSON in production)
//! - Prometheus metrics for the stream, risk gate, orders and strategies

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{init_logging, LoggingConfig};
pub use metrics::Metrics;
