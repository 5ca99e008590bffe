//! Deterministic local broker.
//!
//! Fills every order completely at its limit price or, for market orders,
//! at the cached mid. Used for paper-mode strategies and as the fallback
//! when the live broker fails.

use crate::broker::{AccountInfo, BoxFuture, Broker, BrokerOrder, BrokerPosition, OrderRequest};
use crate::error::{BrokerError, BrokerResult};
use atlas_core::{ClientOrderId, OrderSide, OrderStatus, Price, Size};
use atlas_feed::MarketSnapshotCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Decimal places of paper fill quantities. Keeps `qty * price` exact so
/// the average fill price equals the fill price.
pub const PAPER_QTY_DP: u32 = 8;

#[derive(Debug, Clone)]
struct PaperHolding {
    qty: Decimal,
    cost: Decimal,
}

pub struct PaperBroker {
    cache: Option<Arc<MarketSnapshotCache>>,
    orders: Mutex<HashMap<ClientOrderId, BrokerOrder>>,
    holdings: Mutex<HashMap<String, PaperHolding>>,
    cash: Mutex<Decimal>,
}

impl PaperBroker {
    pub fn new(starting_cash: Decimal) -> Self {
        Self {
            cache: None,
            orders: Mutex::new(HashMap::new()),
            holdings: Mutex::new(HashMap::new()),
            cash: Mutex::new(starting_cash),
        }
    }

    /// Price market orders at the cached mid.
    pub fn with_market_data(mut self, cache: Arc<MarketSnapshotCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Synthesized complete fill of `qty` at `price`.
    ///
    /// The broker order id derives from the client order id, so filling
    /// the same order twice yields the same record.
    pub fn fill_at(client_order_id: &ClientOrderId, qty: Size, price: Price) -> BrokerOrder {
        BrokerOrder {
            broker_order_id: format!("paper-{client_order_id}"),
            client_order_id: client_order_id.clone(),
            status: OrderStatus::Filled,
            filled_qty: qty,
            cumulative_quote_qty: qty.notional(price),
            raw_status: "filled".to_string(),
        }
    }

    fn price_for(&self, request: &OrderRequest) -> Option<Price> {
        request.limit_price.or_else(|| {
            self.cache
                .as_ref()
                .and_then(|cache| cache.mid_price(&request.symbol))
        })
    }

    fn book(&self, request: &OrderRequest, order: &BrokerOrder) {
        let signed = order.filled_qty.inner() * request.side.sign();
        let mut holdings = self.holdings.lock();
        let holding = holdings
            .entry(request.symbol.clone())
            .or_insert(PaperHolding {
                qty: Decimal::ZERO,
                cost: Decimal::ZERO,
            });
        holding.qty += signed;
        holding.cost += order.cumulative_quote_qty * request.side.sign();
        if holding.qty.is_zero() {
            holdings.remove(&request.symbol);
        }
        *self.cash.lock() -= order.cumulative_quote_qty * request.side.sign();
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new(Decimal::from(100_000))
    }
}

impl Broker for PaperBroker {
    fn name(&self) -> &str {
        "paper"
    }

    fn submit_order<'a>(&'a self, request: &'a OrderRequest) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            if let Some(existing) = self.orders.lock().get(&request.client_order_id) {
                return Ok(existing.clone());
            }

            let price = self.price_for(request).ok_or_else(|| {
                BrokerError::Rejected(format!("no reference price for {}", request.symbol))
            })?;
            let qty = if request.qty.is_positive() {
                request.qty
            } else {
                Size::from_notional(request.notional_usd, price).unwrap_or(Size::ZERO)
            };
            let qty = Size::new(qty.inner().round_dp(PAPER_QTY_DP));
            if !qty.is_positive() {
                return Err(BrokerError::Rejected("order quantity is zero".to_string()));
            }

            let order = Self::fill_at(&request.client_order_id, qty, price);
            self.book(request, &order);
            self.orders
                .lock()
                .insert(request.client_order_id.clone(), order.clone());
            debug!(
                client_order_id = %request.client_order_id,
                symbol = %request.symbol,
                qty = %qty,
                price = %price,
                "Paper fill"
            );
            Ok(order)
        })
    }

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>> {
        // Paper orders fill on submission; nothing is ever left to cancel.
        Box::pin(async move {
            let known = self
                .orders
                .lock()
                .values()
                .any(|o| o.broker_order_id == broker_order_id);
            if known {
                Ok(())
            } else {
                Err(BrokerError::NotFound(broker_order_id.to_string()))
            }
        })
    }

    fn get_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            self.orders
                .lock()
                .values()
                .find(|o| o.broker_order_id == broker_order_id)
                .cloned()
                .ok_or_else(|| BrokerError::NotFound(broker_order_id.to_string()))
        })
    }

    fn get_account(&self) -> BoxFuture<'_, BrokerResult<AccountInfo>> {
        Box::pin(async move {
            let cash = *self.cash.lock();
            let holdings_value: Decimal = self.holdings.lock().values().map(|h| h.cost).sum();
            Ok(AccountInfo {
                account_id: "paper".to_string(),
                cash,
                buying_power: cash.max(Decimal::ZERO),
                equity: cash + holdings_value,
            })
        })
    }

    fn get_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<BrokerPosition>>> {
        Box::pin(async move {
            let mut positions: Vec<BrokerPosition> = self
                .holdings
                .lock()
                .iter()
                .map(|(symbol, h)| BrokerPosition {
                    symbol: symbol.clone(),
                    side: if h.qty > Decimal::ZERO {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    qty: Size::new(h.qty.abs()),
                    avg_entry_price: Price::new((h.cost / h.qty).abs()),
                })
                .collect();
            positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
            Ok(positions)
        })
    }
}
