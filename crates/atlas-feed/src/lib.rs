//! Market data feed aggregation for Atlas.
//!
//! Decodes order-book, BBO, asset-context and mid-price frames from the
//! WebSocket registry into a per-symbol `MarketSnapshotCache`.

pub mod error;
pub mod market_state;
pub mod parser;

pub use error::{FeedError, FeedResult};
pub use market_state::{BookView, MarketSnapshotCache};
pub use parser::{BookPayload, MarketEvent, MessageParser, RawLevel, RawNumber};
