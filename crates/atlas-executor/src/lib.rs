//! Order execution for Atlas.
//!
//! Turns triggered intents into broker orders with idempotency keyed on
//! the client order id.
//!
//! # Key Components
//!
//! - [`OrderExecutionPipeline`]: risk gate, order row, broker call, fill and
//!   position bookkeeping, position close
//! - [`Broker`]: venue boundary; [`AlpacaBroker`] is the live client,
//!   [`PaperBroker`] fills locally
//! - [`submit_with_retry`]: exponential backoff on transient failures
//! - [`StatusVocabulary`]: broker status strings to [`atlas_core::OrderStatus`]
//!
//! # Paper fallback
//!
//! When the live broker fails or rejects an order, the pipeline fills it on
//! the paper broker at the intended price (else the cached mid), marks the
//! order `is_paper` and records a `PAPER_FALLBACK` risk event.

pub mod alpaca;
pub mod broker;
pub mod error;
pub mod paper;
pub mod pipeline;
pub mod retry;
pub mod status;

pub use alpaca::{AlpacaBroker, AlpacaConfig};
pub use broker::{
    AccountInfo, BoxFuture, Broker, BrokerOrder, BrokerPosition, DynBroker, OrderRequest,
    OrderType, ScriptedBroker,
};
pub use error::{BrokerError, BrokerResult, ExecutorError, ExecutorResult};
pub use paper::PaperBroker;
pub use pipeline::{CloseReport, ExecutionReport, ExitReason, ExitSignal, OrderExecutionPipeline};
pub use retry::{submit_with_retry, RetryPolicy};
pub use status::StatusVocabulary;
