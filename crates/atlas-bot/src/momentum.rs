//! Momentum patterns from sampled mid prices.
//!
//! Each symbol keeps a short history of mids. When the mid has moved at
//! least `min_move_bps` against the sample `lookback_secs` back, a
//! `momentum` pattern is reported on the side of the move, with strength
//! `|move| / full_strength_bps` clamped to 1.

use crate::config::PatternConfig;
use atlas_core::{OrderSide, Price};
use atlas_strategy::RecentPattern;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::trace;

pub const PATTERN_NAME: &str = "momentum";

pub struct MomentumDetector {
    config: PatternConfig,
    samples: HashMap<String, VecDeque<(DateTime<Utc>, Price)>>,
}

impl MomentumDetector {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            samples: HashMap::new(),
        }
    }

    /// Record `mid` for `symbol` and report a pattern when the move since
    /// the lookback anchor is large enough.
    pub fn observe(&mut self, symbol: &str, mid: Price, now: DateTime<Utc>) -> Option<RecentPattern> {
        let lookback = Duration::seconds(i64::try_from(self.config.lookback_secs).unwrap_or(i64::MAX));
        let history = self.samples.entry(symbol.to_ascii_uppercase()).or_default();
        history.push_back((now, mid));

        // Keep exactly one sample at or beyond the lookback as the anchor.
        while history.len() > 2 && history[1].0 <= now - lookback {
            history.pop_front();
        }
        let &(anchor_ts, anchor) = history.front()?;
        if anchor_ts > now - lookback {
            return None;
        }

        let move_bps = mid.bps_from(anchor)?;
        trace!(symbol, %move_bps, "Momentum sample");
        if move_bps.abs() < self.config.min_move_bps || self.config.full_strength_bps <= Decimal::ZERO {
            return None;
        }

        Some(RecentPattern {
            name: PATTERN_NAME.to_string(),
            side: if move_bps > Decimal::ZERO {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            },
            strength: (move_bps.abs() / self.config.full_strength_bps).min(Decimal::ONE),
            observed_at: now,
        })
    }
}
