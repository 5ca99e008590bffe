//! Message parsing for market data.
//!
//! Decodes the payloads of `l2Book`, `bbo`, `activeAssetCtx` and `allMids`
//! frames into typed `MarketEvent`s. Numeric fields may arrive as strings
//! or as JSON numbers; both are decoded exactly into `Decimal`.
//!
//! Order-book payloads come in two shapes:
//! 1. Paired: `{"levels": [[bids...], [asks...]]}`
//! 2. Named: `{"bids": [...], "asks": [...]}`

use crate::error::{FeedError, FeedResult};
use atlas_core::{BookLevel, BookSide, ChannelType, Price, Size};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

/// Largest price or size magnitude accepted from the wire (10^12). Above it
/// the frame is treated as corrupt.
pub const MAX_QUOTE_MAGNITUDE: Decimal = Decimal::from_parts(0xD4A5_1000, 0xE8, 0, false, 0);

/// Numeric wire value: `"101.5"` or `101.5`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Text(String),
    Number(serde_json::Number),
}

impl RawNumber {
    pub fn to_decimal(&self) -> FeedResult<Decimal> {
        let text = match self {
            Self::Text(s) => s.trim().to_string(),
            Self::Number(n) => n.to_string(),
        };
        Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map_err(|_| FeedError::InvalidNumber(text.clone()))
    }

    /// Decode a price or size, rejecting magnitudes above
    /// [`MAX_QUOTE_MAGNITUDE`].
    pub fn to_quote(&self) -> FeedResult<Decimal> {
        let value = self.to_decimal()?;
        if value.abs() > MAX_QUOTE_MAGNITUDE {
            return Err(FeedError::InvalidNumber(format!("{value} out of range")));
        }
        Ok(value)
    }
}

/// One book level on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawLevel {
    /// `{"px": "100", "sz": "2", "n": 3}`
    Object {
        px: RawNumber,
        sz: RawNumber,
        #[serde(default)]
        n: Option<u32>,
    },
    /// `["100", "2"]` or `["100", "2", 3]`
    Tuple(Vec<RawNumber>),
}

impl RawLevel {
    pub fn to_level(&self) -> FeedResult<BookLevel> {
        let (px, sz) = match self {
            Self::Object { px, sz, .. } => (px, sz),
            Self::Tuple(items) => match items.as_slice() {
                [px, sz, ..] => (px, sz),
                _ => {
                    return Err(FeedError::MalformedLevel(
                        "tuple needs price and size".to_string(),
                    ))
                }
            },
        };
        Ok(BookLevel::new(
            Price::new(px.to_quote()?),
            Size::new(sz.to_quote()?),
        ))
    }
}

/// Order-book payload in either supported shape.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BookPayload {
    Paired {
        #[serde(default)]
        coin: Option<String>,
        #[serde(default)]
        time: Option<i64>,
        levels: (Vec<RawLevel>, Vec<RawLevel>),
    },
    Named {
        #[serde(default)]
        coin: Option<String>,
        #[serde(default)]
        time: Option<i64>,
        #[serde(default)]
        bids: Vec<RawLevel>,
        #[serde(default)]
        asks: Vec<RawLevel>,
    },
}

impl BookPayload {
    pub fn coin(&self) -> Option<&str> {
        match self {
            Self::Paired { coin, .. } | Self::Named { coin, .. } => coin.as_deref(),
        }
    }

    pub fn time(&self) -> Option<i64> {
        match self {
            Self::Paired { time, .. } | Self::Named { time, .. } => *time,
        }
    }

    fn sides(&self) -> (&[RawLevel], &[RawLevel]) {
        match self {
            Self::Paired { levels, .. } => (&levels.0, &levels.1),
            Self::Named { bids, asks, .. } => (bids, asks),
        }
    }

    /// Normalized `(bids, asks)`, best-first with empty levels dropped.
    pub fn normalize(&self) -> FeedResult<(Vec<BookLevel>, Vec<BookLevel>)> {
        let (raw_bids, raw_asks) = self.sides();
        let bids = raw_bids
            .iter()
            .map(RawLevel::to_level)
            .collect::<FeedResult<Vec<_>>>()?;
        let asks = raw_asks
            .iter()
            .map(RawLevel::to_level)
            .collect::<FeedResult<Vec<_>>>()?;
        Ok((BookSide::Bid.normalize(bids), BookSide::Ask.normalize(asks)))
    }
}

#[derive(Debug, Deserialize)]
struct BboPayload {
    coin: String,
    #[serde(default)]
    time: Option<i64>,
    bbo: (Option<RawLevel>, Option<RawLevel>),
}

#[derive(Debug, Deserialize)]
struct AssetCtxPayload {
    coin: String,
    ctx: AssetCtxData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetCtxData {
    #[serde(default)]
    mark_px: Option<RawNumber>,
    #[serde(default)]
    oracle_px: Option<RawNumber>,
    #[serde(default)]
    mid_px: Option<RawNumber>,
    #[serde(default)]
    funding: Option<RawNumber>,
    #[serde(default)]
    open_interest: Option<RawNumber>,
    #[serde(default)]
    day_ntl_vlm: Option<RawNumber>,
}

#[derive(Debug, Deserialize)]
struct AllMidsPayload {
    mids: BTreeMap<String, RawNumber>,
}

/// Parsed market data event.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    /// Full order-book replacement.
    Book {
        symbol: String,
        bids: Vec<BookLevel>,
        asks: Vec<BookLevel>,
        time_ms: Option<i64>,
    },
    /// Top of book only.
    Bbo {
        symbol: String,
        bid: Option<BookLevel>,
        ask: Option<BookLevel>,
        time_ms: Option<i64>,
    },
    /// Asset context (mark, oracle, funding, open interest, volume).
    AssetCtx {
        symbol: String,
        mark_price: Option<Price>,
        oracle_price: Option<Price>,
        mid_price: Option<Price>,
        funding_rate: Option<Decimal>,
        open_interest: Option<Decimal>,
        volume_24h: Option<Decimal>,
    },
    /// Mid prices for many symbols.
    Mids(Vec<(String, Price)>),
}

impl MarketEvent {
    /// Symbol the event applies to; `None` for multi-symbol events.
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Book { symbol, .. } | Self::Bbo { symbol, .. } | Self::AssetCtx { symbol, .. } => {
                Some(symbol)
            }
            Self::Mids(_) => None,
        }
    }
}

fn opt_decimal(value: &Option<RawNumber>) -> FeedResult<Option<Decimal>> {
    value.as_ref().map(RawNumber::to_decimal).transpose()
}

fn opt_price(value: &Option<RawNumber>) -> FeedResult<Option<Price>> {
    let px = value.as_ref().map(RawNumber::to_quote).transpose()?;
    Ok(px.map(Price::new).filter(Price::is_positive))
}

/// Stateless market-data message parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageParser;

impl MessageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a channel payload into a market event.
    ///
    /// Returns `Ok(None)` for channels that carry no market state.
    pub fn parse(&self, channel: ChannelType, data: &Value) -> FeedResult<Option<MarketEvent>> {
        match channel {
            ChannelType::L2Book => self.parse_book(data).map(Some),
            ChannelType::Bbo => self.parse_bbo(data).map(Some),
            ChannelType::ActiveAssetCtx => self.parse_asset_ctx(data).map(Some),
            ChannelType::AllMids => self.parse_all_mids(data).map(Some),
            other => {
                debug!(channel = %other, "Channel carries no market state, ignoring");
                Ok(None)
            }
        }
    }

    /// Parse an order-book payload in either shape.
    pub fn parse_book(&self, data: &Value) -> FeedResult<MarketEvent> {
        let payload = BookPayload::deserialize(data)
            .map_err(|e| FeedError::payload("l2Book", e))?;
        let symbol = payload
            .coin()
            .map(str::to_ascii_uppercase)
            .ok_or(FeedError::MissingCoin("l2Book"))?;
        let (bids, asks) = payload.normalize()?;

        debug!(
            %symbol,
            bids = bids.len(),
            asks = asks.len(),
            "Book update"
        );
        Ok(MarketEvent::Book {
            symbol,
            bids,
            asks,
            time_ms: payload.time(),
        })
    }

    fn parse_bbo(&self, data: &Value) -> FeedResult<MarketEvent> {
        let payload = BboPayload::deserialize(data)
            .map_err(|e| FeedError::payload("bbo", e))?;

        let side = |level: &Option<RawLevel>| -> FeedResult<Option<BookLevel>> {
            Ok(level
                .as_ref()
                .map(RawLevel::to_level)
                .transpose()?
                .filter(|l| l.price.is_positive() && l.size.is_positive()))
        };

        Ok(MarketEvent::Bbo {
            symbol: payload.coin.to_ascii_uppercase(),
            bid: side(&payload.bbo.0)?,
            ask: side(&payload.bbo.1)?,
            time_ms: payload.time,
        })
    }

    fn parse_asset_ctx(&self, data: &Value) -> FeedResult<MarketEvent> {
        let payload = AssetCtxPayload::deserialize(data)
            .map_err(|e| FeedError::payload("activeAssetCtx", e))?;
        let ctx = &payload.ctx;

        Ok(MarketEvent::AssetCtx {
            symbol: payload.coin.to_ascii_uppercase(),
            mark_price: opt_price(&ctx.mark_px)?,
            oracle_price: opt_price(&ctx.oracle_px)?,
            mid_price: opt_price(&ctx.mid_px)?,
            funding_rate: opt_decimal(&ctx.funding)?,
            open_interest: opt_decimal(&ctx.open_interest)?,
            volume_24h: opt_decimal(&ctx.day_ntl_vlm)?,
        })
    }

    fn parse_all_mids(&self, data: &Value) -> FeedResult<MarketEvent> {
        let payload = AllMidsPayload::deserialize(data)
            .map_err(|e| FeedError::payload("allMids", e))?;
        let mids = payload
            .mids
            .iter()
            .map(|(coin, px)| Ok((coin.to_ascii_uppercase(), Price::new(px.to_quote()?))))
            .collect::<FeedResult<Vec<_>>>()?;
        Ok(MarketEvent::Mids(mids))
    }
}
