//! Execution pipeline rows.
//!
//! An intent moves strictly forward: Intent → Order → Fill → Position.
//! The only re-entry is an order retry, which reuses the intent's
//! `ClientOrderId`.

use crate::{CoreError, Price, Size};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell (for PnL calculations).
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = CoreError;

    /// Accepts the vocabularies used by the decision agent and brokers
    /// (`buy`/`sell`, `long`/`short`), case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "long" | "b" => Ok(Self::Buy),
            "sell" | "short" | "s" | "a" => Ok(Self::Sell),
            other => Err(CoreError::InvalidSide(other.to_string())),
        }
    }
}

/// Client order ID for idempotency.
///
/// Generated once per intent. Every broker submission and retry for that
/// intent carries the same value, and the order table is keyed on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    /// Create a new unique client order ID.
    ///
    /// Format: `atlas_{timestamp_ms}_{uuid_short}`
    pub fn new() -> Self {
        let ts = Utc::now().timestamp_millis();
        let uuid = Uuid::new_v4().simple().to_string();
        Self(format!("atlas_{ts}_{}", &uuid[..12]))
    }

    /// Create from an existing string (for parsing responses).
    pub fn from_string(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ClientOrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ClientOrderId {
    fn from(s: String) -> Self {
        Self::from_string(s)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientOrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fresh row identifier.
pub fn new_row_id() -> String {
    Uuid::new_v4().to_string()
}

// ============================================================================
// Intent
// ============================================================================

/// Intent lifecycle: `pending → approved | denied → submitted → filled | failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Pending,
    Approved,
    Denied,
    Submitted,
    Filled,
    Failed,
}

impl IntentStatus {
    /// Whether moving to `next` keeps the lifecycle strictly forward.
    pub fn can_advance_to(&self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Denied)
                | (Approved, Submitted)
                | (Submitted, Filled)
                | (Submitted, Failed)
        )
    }
}

impl fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Submitted => "submitted",
            Self::Filled => "filled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A request to open a position, produced by a user or the decision agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Requested notional in USD.
    pub qty_usd: Decimal,
    pub intended_price: Option<Price>,
    pub stop_loss_price: Option<Price>,
    pub take_profit_price: Option<Price>,
    pub client_order_id: ClientOrderId,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
}

impl Intent {
    /// New pending intent with a freshly generated client order ID.
    pub fn new(
        strategy_id: impl Into<String>,
        symbol: impl Into<String>,
        side: OrderSide,
        qty_usd: Decimal,
    ) -> Self {
        Self {
            id: new_row_id(),
            strategy_id: strategy_id.into(),
            symbol: symbol.into().to_ascii_uppercase(),
            side,
            qty_usd,
            intended_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            client_order_id: ClientOrderId::new(),
            status: IntentStatus::Pending,
            created_at: Utc::now(),
        }
    }

    pub fn with_intended_price(mut self, price: Price) -> Self {
        self.intended_price = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: Price) -> Self {
        self.stop_loss_price = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: Price) -> Self {
        self.take_profit_price = Some(price);
        self
    }

    /// Check the intent before anything is written or sent.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.symbol.trim().is_empty() {
            return Err(CoreError::InvalidSymbol("symbol is empty".to_string()));
        }
        if self.qty_usd <= Decimal::ZERO {
            return Err(CoreError::InvalidSize(format!(
                "notional must be positive, got {}",
                self.qty_usd
            )));
        }
        for (name, price) in [
            ("intended_price", self.intended_price),
            ("stop_loss_price", self.stop_loss_price),
            ("take_profit_price", self.take_profit_price),
        ] {
            if let Some(p) = price {
                if !p.is_positive() {
                    return Err(CoreError::InvalidPrice(format!("{name} must be positive, got {p}")));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Order
// ============================================================================

/// Normalized order status.
///
/// Broker vocabularies are mapped onto this set by the executor;
/// anything unrecognized is treated as `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Whether the broker may still hold a live order.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Submitted | Self::PartiallyFilled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Filled => "filled",
            Self::PartiallyFilled => "partially_filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Average fill price from broker aggregates.
///
/// Only defined when both the filled quantity and the cumulative quote
/// quantity are positive.
pub fn average_fill_price(filled_qty: Size, cumulative_quote_qty: Decimal) -> Option<Price> {
    if filled_qty.is_positive() && cumulative_quote_qty > Decimal::ZERO {
        Some(Price::new(cumulative_quote_qty / filled_qty.inner()))
    } else {
        None
    }
}

/// Broker order row, keyed by `client_order_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub intent_id: String,
    pub client_order_id: ClientOrderId,
    pub broker_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Requested base quantity (zero until a reference price is known).
    pub qty: Size,
    pub filled_qty: Size,
    pub filled_avg_price: Option<Price>,
    pub cumulative_quote_qty: Decimal,
    pub is_paper: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Pending row for an intent, written before any broker call.
    pub fn pending(intent: &Intent, now: DateTime<Utc>) -> Self {
        let qty = intent
            .intended_price
            .and_then(|p| Size::from_notional(intent.qty_usd, p))
            .unwrap_or(Size::ZERO);
        Self {
            id: new_row_id(),
            intent_id: intent.id.clone(),
            client_order_id: intent.client_order_id.clone(),
            broker_order_id: None,
            symbol: intent.symbol.clone(),
            side: intent.side,
            status: OrderStatus::Pending,
            qty,
            filled_qty: Size::ZERO,
            filled_avg_price: None,
            cumulative_quote_qty: Decimal::ZERO,
            is_paper: false,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply broker fill aggregates, recomputing the average price.
    pub fn apply_fill(&mut self, filled_qty: Size, cumulative_quote_qty: Decimal) {
        self.filled_qty = filled_qty;
        self.cumulative_quote_qty = cumulative_quote_qty;
        self.filled_avg_price = average_fill_price(filled_qty, cumulative_quote_qty);
    }

    pub fn has_fill(&self) -> bool {
        self.filled_qty.is_positive()
    }
}

// ============================================================================
// Fill / Position
// ============================================================================

/// Execution record for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: String,
    pub price: Price,
    pub qty: Size,
    pub fee: Decimal,
    pub filled_at: DateTime<Utc>,
}

/// Open or closed position, created once per filled entry order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Size,
    pub entry_price: Price,
    pub stop_loss_price: Option<Price>,
    pub take_profit_price: Option<Price>,
    /// Relation to the entry order row.
    pub entry_order_id: String,
    pub is_open: bool,
    pub is_paper: bool,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Price>,
    pub realized_pnl_usd: Option<Decimal>,
}

impl Position {
    /// PnL in USD if the position were closed at `price`.
    pub fn pnl_at(&self, price: Price) -> Decimal {
        (price.inner() - self.entry_price.inner()) * self.qty.inner() * self.side.sign()
    }

    /// Close the position. Returns the realized PnL, or `None` when the
    /// position was already closed.
    pub fn close(&mut self, exit_price: Price, now: DateTime<Utc>) -> Option<Decimal> {
        if !self.is_open {
            return None;
        }
        let pnl = self.pnl_at(exit_price);
        self.is_open = false;
        self.closed_at = Some(now);
        self.exit_price = Some(exit_price);
        self.realized_pnl_usd = Some(pnl);
        Some(pnl)
    }

    /// Stop-loss crossed at `price`.
    pub fn stop_loss_hit(&self, price: Price) -> bool {
        match (self.stop_loss_price, self.side) {
            (Some(sl), OrderSide::Buy) => price <= sl,
            (Some(sl), OrderSide::Sell) => price >= sl,
            (None, _) => false,
        }
    }

    /// Take-profit crossed at `price`.
    pub fn take_profit_hit(&self, price: Price) -> bool {
        match (self.take_profit_price, self.side) {
            (Some(tp), OrderSide::Buy) => price >= tp,
            (Some(tp), OrderSide::Sell) => price <= tp,
            (None, _) => false,
        }
    }
}
