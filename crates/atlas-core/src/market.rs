//! Per-symbol market view.
//!
//! `MarketSnapshot` is written only by the feed's dispatch path. Everything
//! derived from it (mid, spread, depth, staleness) is computed on read.

use crate::{Price, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    /// Sort levels best-first and drop empty levels.
    ///
    /// Bids are sorted descending, asks ascending.
    pub fn normalize(&self, mut levels: Vec<BookLevel>) -> Vec<BookLevel> {
        levels.retain(|l| l.size.is_positive() && l.price.is_positive());
        match self {
            Self::Bid => levels.sort_by(|a, b| b.price.cmp(&a.price)),
            Self::Ask => levels.sort_by(|a, b| a.price.cmp(&b.price)),
        }
        levels
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bid => write!(f, "bid"),
            Self::Ask => write!(f, "ask"),
        }
    }
}

/// One price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Price,
    pub size: Size,
}

impl BookLevel {
    pub fn new(price: Price, size: Size) -> Self {
        Self { price, size }
    }
}

/// Book level with running totals from the top of book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Price,
    pub size: Size,
    pub cumulative_size: Size,
    pub cumulative_notional: Decimal,
}

/// Accumulate depth over best-first levels.
pub fn cumulative_depth(levels: &[BookLevel], depth: usize) -> Vec<DepthLevel> {
    let mut total_size = Size::ZERO;
    let mut total_notional = Decimal::ZERO;
    levels
        .iter()
        .take(depth)
        .map(|level| {
            total_size = total_size + level.size;
            total_notional = total_notional.saturating_add(level.size.notional(level.price));
            DepthLevel {
                price: level.price,
                size: level.size,
                cumulative_size: total_size,
                cumulative_notional: total_notional,
            }
        })
        .collect()
}

/// Current market view for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub mark_price: Option<Price>,
    pub oracle_price: Option<Price>,
    /// Last mid published on the `allMids` channel.
    pub published_mid: Option<Price>,
    pub funding_rate: Option<Decimal>,
    pub open_interest: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    /// Bids, best (highest) first.
    pub bids: Vec<BookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<BookLevel>,
    /// Venue timestamp of the last applied book, used to reject stale books.
    pub book_time_ms: Option<i64>,
    pub last_update_ts: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    pub fn best_bid(&self) -> Option<BookLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<BookLevel> {
        self.asks.first().copied()
    }

    /// Mid of the top of book, falling back to the published mid.
    pub fn mid_price(&self) -> Option<Price> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(bid.price.midpoint(ask.price)),
            _ => self.published_mid,
        }
    }

    /// Best ask minus best bid.
    pub fn spread(&self) -> Option<Price> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some(ask.price - bid.price)
    }

    /// Spread as a percentage of the best bid.
    pub fn spread_pct(&self) -> Option<Decimal> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        ask.price.pct_from(bid.price)
    }

    /// Reference price for valuations: mark, then mid.
    pub fn reference_price(&self) -> Option<Price> {
        self.mark_price.or_else(|| self.mid_price())
    }

    /// Milliseconds since the last update, `None` before the first update.
    pub fn staleness_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_update_ts
            .map(|ts| (now - ts).num_milliseconds().max(0))
    }

    pub fn depth(&self, side: BookSide, depth: usize) -> Vec<DepthLevel> {
        match side {
            BookSide::Bid => cumulative_depth(&self.bids, depth),
            BookSide::Ask => cumulative_depth(&self.asks, depth),
        }
    }
}
