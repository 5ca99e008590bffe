//! Core domain types for the Atlas trading engine.
//!
//! This crate provides the types shared by every other crate:
//! - `Price`, `Size`: Precision-safe numeric types
//! - `SubscriptionSpec`, `ChannelKey`: Market-data subscription identity
//! - `MarketSnapshot`, `BookLevel`: Per-symbol market view
//! - `Strategy`, `StrategyState`: Strategy rows and lifecycle states
//! - `Intent`, `Order`, `Fill`, `Position`: Execution pipeline rows
//! - `RiskState`, `RiskCode`, `Severity`: Risk bookkeeping
//! - `Clock`: Injectable wall clock

pub mod clock;
pub mod decimal;
pub mod error;
pub mod market;
pub mod order;
pub mod risk;
pub mod strategy;
pub mod subscription;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decimal::{Price, Size};
pub use error::{CoreError, Result};
pub use market::{BookLevel, BookSide, DepthLevel, MarketSnapshot};
pub use order::{
    ClientOrderId, Fill, Intent, IntentStatus, Order, OrderSide, OrderStatus, Position,
};
pub use risk::{RiskCode, RiskEvent, RiskState, Severity};
pub use strategy::{Strategy, StrategyLimits, StrategyMode, StrategyState};
pub use subscription::{ChannelKey, ChannelType, SubscriptionSpec};
