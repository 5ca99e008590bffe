//! Broker boundary.
//!
//! The pipeline talks to brokers only through the `Broker` trait, which
//! keeps the live client, the paper broker and test doubles
//! interchangeable.

use crate::error::{BrokerError, BrokerResult};
use atlas_core::{ClientOrderId, Intent, OrderSide, OrderStatus, Price, Size};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Order submission. Retries resend the same request, so the client
/// order id never changes between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub symbol: String,
    pub side: OrderSide,
    /// Base quantity, zero when only the notional is known.
    pub qty: Size,
    pub notional_usd: Decimal,
    pub order_type: OrderType,
    pub limit_price: Option<Price>,
}

impl OrderRequest {
    /// Market order for an intent.
    pub fn market(intent: &Intent, qty: Size) -> Self {
        Self {
            client_order_id: intent.client_order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty,
            notional_usd: intent.qty_usd,
            order_type: OrderType::Market,
            limit_price: None,
        }
    }

    /// Market order that flattens `qty` of an open position.
    pub fn closing(symbol: &str, position_side: OrderSide, qty: Size) -> Self {
        Self {
            client_order_id: ClientOrderId::new(),
            symbol: symbol.to_string(),
            side: position_side.opposite(),
            qty,
            notional_usd: Decimal::ZERO,
            order_type: OrderType::Market,
            limit_price: None,
        }
    }
}

/// Broker view of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub client_order_id: ClientOrderId,
    pub status: OrderStatus,
    pub filled_qty: Size,
    pub cumulative_quote_qty: Decimal,
    /// Status as the broker reported it.
    pub raw_status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub equity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Size,
    pub avg_entry_price: Price,
}

/// Order routing venue.
pub trait Broker: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    fn submit_order<'a>(&'a self, request: &'a OrderRequest) -> BoxFuture<'a, BrokerResult<BrokerOrder>>;

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>>;

    fn get_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<BrokerOrder>>;

    fn get_account(&self) -> BoxFuture<'_, BrokerResult<AccountInfo>>;

    fn get_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<BrokerPosition>>>;
}

/// Arc wrapper for Broker trait objects.
pub type DynBroker = Arc<dyn Broker>;

// ============================================================================
// ScriptedBroker
// ============================================================================

/// Broker double that replays scripted submit results.
///
/// With an empty script every submission fills completely at its limit
/// price, or at 100 when none is given.
#[derive(Debug, Default)]
pub struct ScriptedBroker {
    submits: Mutex<VecDeque<BrokerResult<BrokerOrder>>>,
    requests: Mutex<Vec<OrderRequest>>,
    cancels: Mutex<Vec<String>>,
    lookups: Mutex<VecDeque<BrokerResult<BrokerOrder>>>,
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next submission.
    pub fn push_submit(&self, result: BrokerResult<BrokerOrder>) {
        self.submits.lock().push_back(result);
    }

    /// Queue the result of the next `get_order`.
    pub fn push_lookup(&self, result: BrokerResult<BrokerOrder>) {
        self.lookups.lock().push_back(result);
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<OrderRequest> {
        self.requests.lock().clone()
    }

    pub fn cancels(&self) -> Vec<String> {
        self.cancels.lock().clone()
    }

    /// Broker order for `request` with the given outcome.
    pub fn order_for(
        request: &OrderRequest,
        status: OrderStatus,
        filled_qty: Size,
        cumulative_quote_qty: Decimal,
    ) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: format!("scripted-{}", request.client_order_id),
            client_order_id: request.client_order_id.clone(),
            status,
            filled_qty,
            cumulative_quote_qty,
            raw_status: status.as_str().to_string(),
        }
    }

    fn default_fill(request: &OrderRequest) -> BrokerOrder {
        let price = request.limit_price.unwrap_or(Price::new(Decimal::ONE_HUNDRED));
        let qty = if request.qty.is_positive() {
            request.qty
        } else {
            Size::from_notional(request.notional_usd, price).unwrap_or(Size::ZERO)
        };
        Self::order_for(request, OrderStatus::Filled, qty, qty.notional(price))
    }
}

impl Broker for ScriptedBroker {
    fn name(&self) -> &str {
        "scripted"
    }

    fn submit_order<'a>(&'a self, request: &'a OrderRequest) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            self.requests.lock().push(request.clone());
            match self.submits.lock().pop_front() {
                Some(Ok(mut order)) => {
                    order.client_order_id = request.client_order_id.clone();
                    Ok(order)
                }
                Some(Err(e)) => Err(e),
                None => Ok(Self::default_fill(request)),
            }
        })
    }

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            self.cancels.lock().push(broker_order_id.to_string());
            Ok(())
        })
    }

    fn get_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            self.lookups
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(BrokerError::NotFound(broker_order_id.to_string())))
        })
    }

    fn get_account(&self) -> BoxFuture<'_, BrokerResult<AccountInfo>> {
        Box::pin(async move {
            Ok(AccountInfo {
                account_id: "scripted".to_string(),
                cash: Decimal::ZERO,
                buying_power: Decimal::ZERO,
                equity: Decimal::ZERO,
            })
        })
    }

    fn get_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<BrokerPosition>>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}
