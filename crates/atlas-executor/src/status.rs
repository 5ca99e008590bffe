//! Broker status vocabularies.
//!
//! Each venue reports order status in its own words. They are mapped onto
//! `OrderStatus` through explicit tables; anything not listed is `Pending`
//! so an unfamiliar status never reads as a terminal outcome.

use atlas_core::OrderStatus;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Status vocabulary of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusVocabulary {
    Binance,
    Alpaca,
}

const BINANCE_STATUSES: &[(&str, OrderStatus)] = &[
    ("NEW", OrderStatus::Submitted),
    ("PENDING_NEW", OrderStatus::Pending),
    ("PARTIALLY_FILLED", OrderStatus::PartiallyFilled),
    ("FILLED", OrderStatus::Filled),
    ("PENDING_CANCEL", OrderStatus::Submitted),
    ("CANCELED", OrderStatus::Cancelled),
    ("REJECTED", OrderStatus::Rejected),
    ("EXPIRED", OrderStatus::Expired),
    ("EXPIRED_IN_MATCH", OrderStatus::Expired),
];

const ALPACA_STATUSES: &[(&str, OrderStatus)] = &[
    ("pending_new", OrderStatus::Pending),
    ("accepted", OrderStatus::Submitted),
    ("new", OrderStatus::Submitted),
    ("accepted_for_bidding", OrderStatus::Submitted),
    ("pending_cancel", OrderStatus::Submitted),
    ("pending_replace", OrderStatus::Submitted),
    ("calculated", OrderStatus::Submitted),
    ("partially_filled", OrderStatus::PartiallyFilled),
    ("filled", OrderStatus::Filled),
    ("done_for_day", OrderStatus::Expired),
    ("canceled", OrderStatus::Cancelled),
    ("replaced", OrderStatus::Cancelled),
    ("stopped", OrderStatus::Submitted),
    ("rejected", OrderStatus::Rejected),
    ("suspended", OrderStatus::Rejected),
    ("expired", OrderStatus::Expired),
];

impl StatusVocabulary {
    fn table(&self) -> &'static [(&'static str, OrderStatus)] {
        match self {
            Self::Binance => BINANCE_STATUSES,
            Self::Alpaca => ALPACA_STATUSES,
        }
    }

    /// Map a raw broker status. Case and surrounding whitespace are ignored.
    pub fn map(&self, raw: &str) -> OrderStatus {
        let raw = raw.trim();
        self.table()
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(raw))
            .map(|(_, status)| *status)
            .unwrap_or_else(|| {
                warn!(vocabulary = ?self, status = raw, "Unknown broker status, treating as pending");
                OrderStatus::Pending
            })
    }
}
