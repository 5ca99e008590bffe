//! Market snapshot cache.
//!
//! One entry per symbol, mutated only from the dispatch path. Readers on
//! other tasks clone the snapshot under a read lock and never observe a
//! half-applied update.

use crate::error::FeedResult;
use crate::parser::{MarketEvent, MessageParser};
use atlas_core::{BookLevel, BookSide, Clock, DepthLevel, MarketSnapshot, Price};
use atlas_ws::StreamFrame;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, trace};

type SnapshotEntry = Arc<RwLock<MarketSnapshot>>;

/// Read-only book view with derived metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct BookView {
    pub symbol: String,
    pub best_bid: Option<BookLevel>,
    pub best_ask: Option<BookLevel>,
    pub mid: Option<Price>,
    pub spread: Option<Price>,
    /// Spread as a percentage of the best bid.
    pub spread_pct: Option<Decimal>,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Outcome of applying one event to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Updated,
    StaleBook,
}

/// Per-symbol market snapshot cache.
pub struct MarketSnapshotCache {
    markets: DashMap<String, SnapshotEntry>,
    parser: MessageParser,
    clock: Arc<dyn Clock>,
}

impl MarketSnapshotCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            markets: DashMap::new(),
            parser: MessageParser::new(),
            clock,
        }
    }

    fn get_or_create(&self, symbol: &str) -> SnapshotEntry {
        self.markets
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(MarketSnapshot::new(symbol))))
            .clone()
    }

    fn entry(&self, symbol: &str) -> Option<SnapshotEntry> {
        self.markets
            .get(&symbol.to_ascii_uppercase())
            .map(|e| e.value().clone())
    }

    /// Decode and apply a routed frame.
    ///
    /// Returns `Ok(false)` when the frame carries no market state or was
    /// discarded as stale.
    pub fn ingest(&self, frame: &StreamFrame) -> FeedResult<bool> {
        let Some(event) = self.parser.parse(frame.channel_type, &frame.data)? else {
            return Ok(false);
        };
        Ok(self.apply(event, self.clock.now()))
    }

    /// Apply a parsed event at `now`.
    ///
    /// Returns false when a book older than the last applied one was
    /// discarded.
    pub fn apply(&self, event: MarketEvent, now: DateTime<Utc>) -> bool {
        match event {
            MarketEvent::Mids(mids) => {
                for (symbol, mid) in mids {
                    let entry = self.get_or_create(&symbol);
                    let mut snapshot = entry.write();
                    snapshot.published_mid = Some(mid);
                    snapshot.last_update_ts = Some(now);
                }
                true
            }
            event => {
                let Some(symbol) = event.symbol().map(str::to_string) else {
                    return false;
                };
                let entry = self.get_or_create(&symbol);
                let mut snapshot = entry.write();
                let applied = apply_to_snapshot(&mut snapshot, event, now);
                if applied == Applied::StaleBook {
                    debug!(%symbol, last = ?snapshot.book_time_ms, "Discarding stale book update");
                }
                applied == Applied::Updated
            }
        }
    }

    /// Cloned snapshot for `symbol`.
    pub fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.entry(symbol).map(|e| e.read().clone())
    }

    pub fn staleness_ms(&self, symbol: &str, now: DateTime<Utc>) -> Option<i64> {
        self.entry(symbol)?.read().staleness_ms(now)
    }

    /// True when the symbol has never been updated or its last update is
    /// older than `max_age`.
    pub fn is_stale(&self, symbol: &str, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.staleness_ms(symbol, now) {
            Some(age) => age > max_age.num_milliseconds(),
            None => true,
        }
    }

    pub fn mid_price(&self, symbol: &str) -> Option<Price> {
        self.entry(symbol)?.read().mid_price()
    }

    /// Reference price (mark, then mid) for valuations.
    pub fn reference_price(&self, symbol: &str) -> Option<Price> {
        self.entry(symbol)?.read().reference_price()
    }

    pub fn book_view(&self, symbol: &str, depth: usize) -> Option<BookView> {
        let entry = self.entry(symbol)?;
        let snapshot = entry.read();
        Some(BookView {
            symbol: snapshot.symbol.clone(),
            best_bid: snapshot.best_bid(),
            best_ask: snapshot.best_ask(),
            mid: snapshot.mid_price(),
            spread: snapshot.spread(),
            spread_pct: snapshot.spread_pct(),
            bids: snapshot.depth(BookSide::Bid, depth),
            asks: snapshot.depth(BookSide::Ask, depth),
        })
    }

    /// Tracked symbols, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.markets.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markets.is_empty()
    }
}

fn apply_to_snapshot(snapshot: &mut MarketSnapshot, event: MarketEvent, now: DateTime<Utc>) -> Applied {
    match event {
        MarketEvent::Book {
            bids,
            asks,
            time_ms,
            ..
        } => {
            if let (Some(incoming), Some(last)) = (time_ms, snapshot.book_time_ms) {
                if incoming < last {
                    return Applied::StaleBook;
                }
            }
            snapshot.bids = bids;
            snapshot.asks = asks;
            if time_ms.is_some() {
                snapshot.book_time_ms = time_ms;
            }
        }
        MarketEvent::Bbo { bid, ask, .. } => {
            if let Some(bid) = bid {
                snapshot.bids.retain(|l| l.price < bid.price);
                snapshot.bids.insert(0, bid);
            }
            if let Some(ask) = ask {
                snapshot.asks.retain(|l| l.price > ask.price);
                snapshot.asks.insert(0, ask);
            }
        }
        MarketEvent::AssetCtx {
            mark_price,
            oracle_price,
            mid_price,
            funding_rate,
            open_interest,
            volume_24h,
            ..
        } => {
            snapshot.mark_price = mark_price.or(snapshot.mark_price);
            snapshot.oracle_price = oracle_price.or(snapshot.oracle_price);
            snapshot.published_mid = mid_price.or(snapshot.published_mid);
            snapshot.funding_rate = funding_rate.or(snapshot.funding_rate);
            snapshot.open_interest = open_interest.or(snapshot.open_interest);
            snapshot.volume_24h = volume_24h.or(snapshot.volume_24h);
        }
        MarketEvent::Mids(_) => {}
    }
    snapshot.last_update_ts = Some(now);
    trace!(symbol = %snapshot.symbol, "Snapshot updated");
    Applied::Updated
}
