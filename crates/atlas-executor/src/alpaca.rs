//! Alpaca REST broker.
//!
//! Orders are placed with `POST /v2/orders` carrying our client order id,
//! so a resubmission after a lost response is recognized by the venue.
//! HTTP failures are classified into `BrokerError` variants; only
//! transport errors, timeouts, 429 and 5xx are retryable.

use crate::broker::{
    AccountInfo, BoxFuture, Broker, BrokerOrder, BrokerPosition, OrderRequest, OrderType,
};
use crate::error::{BrokerError, BrokerResult};
use crate::status::StatusVocabulary;
use atlas_core::{ClientOrderId, OrderSide, Price, Size};
use reqwest::{Client, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings.
#[derive(Debug, Clone)]
pub struct AlpacaConfig {
    /// e.g. `https://paper-api.alpaca.markets`
    pub base_url: String,
    pub key_id: String,
    pub secret_key: String,
    /// Quote currency appended to bare symbols (`BTC` -> `BTC/USD`).
    pub quote_currency: String,
}

#[derive(Debug, Serialize)]
struct NewOrderBody {
    symbol: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    time_in_force: &'static str,
    client_order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    qty: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notional: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: String,
    status: String,
    #[serde(default)]
    filled_qty: Option<Decimal>,
    #[serde(default)]
    filled_avg_price: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    id: String,
    cash: Decimal,
    buying_power: Decimal,
    equity: Decimal,
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    side: String,
    qty: Decimal,
    avg_entry_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct AlpacaErrorBody {
    #[serde(default)]
    message: String,
}

/// Map an Alpaca order onto the broker view.
fn to_broker_order(order: AlpacaOrder) -> BrokerOrder {
    let filled_qty = Size::new(order.filled_qty.unwrap_or_default());
    let cumulative_quote_qty = match order.filled_avg_price {
        Some(px) if filled_qty.is_positive() => filled_qty.inner() * px,
        _ => Decimal::ZERO,
    };
    BrokerOrder {
        broker_order_id: order.id,
        client_order_id: ClientOrderId::from_string(order.client_order_id),
        status: StatusVocabulary::Alpaca.map(&order.status),
        filled_qty,
        cumulative_quote_qty,
        raw_status: order.status,
    }
}

/// Classify a non-success HTTP response.
pub fn classify_http_error(status: StatusCode, body: &str) -> BrokerError {
    let message = serde_json::from_str::<AlpacaErrorBody>(body)
        .map(|b| b.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());
    let lowered = message.to_ascii_lowercase();

    match status.as_u16() {
        451 => BrokerError::GeoBlocked(message),
        403 if lowered.contains("region") || lowered.contains("restricted location") => {
            BrokerError::GeoBlocked(message)
        }
        401 | 403 => BrokerError::Auth(message),
        404 => BrokerError::NotFound(message),
        408 => BrokerError::Timeout(message),
        429 => BrokerError::RateLimited,
        400 | 409 | 422 => BrokerError::Rejected(message),
        s if s >= 500 => BrokerError::Transport(format!("HTTP {status}: {message}")),
        _ => BrokerError::Rejected(format!("HTTP {status}: {message}")),
    }
}

fn transport_error(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout(e.to_string())
    } else {
        BrokerError::Transport(e.to_string())
    }
}

/// Alpaca REST client.
pub struct AlpacaBroker {
    client: Client,
    config: AlpacaConfig,
}

impl AlpacaBroker {
    pub fn new(config: AlpacaConfig) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Transport(format!("Failed to create HTTP client: {e}")))?;
        info!(base_url = %config.base_url, "Alpaca broker configured");
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn venue_symbol(&self, symbol: &str) -> String {
        if symbol.contains('/') {
            symbol.to_string()
        } else {
            format!("{symbol}/{}", self.config.quote_currency)
        }
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("APCA-API-KEY-ID", &self.config.key_id)
            .header("APCA-API-SECRET-KEY", &self.config.secret_key)
    }

    async fn send<T: DeserializeOwned>(&self, op: &str, builder: RequestBuilder) -> BrokerResult<T> {
        let started = Instant::now();
        let result = self.send_inner(builder).await;
        atlas_telemetry::Metrics::broker_latency(
            "alpaca",
            op,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        let body = result?;
        serde_json::from_str(&body).map_err(|e| BrokerError::Decode(format!("{op}: {e}")))
    }

    async fn send_inner(&self, builder: RequestBuilder) -> BrokerResult<String> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            let error = classify_http_error(status, &body);
            warn!(%status, error = %error, "Alpaca request failed");
            return Err(error);
        }
        Ok(body)
    }

    fn order_body(&self, request: &OrderRequest) -> NewOrderBody {
        let (qty, notional) = if request.qty.is_positive() {
            (Some(request.qty.inner()), None)
        } else {
            (None, Some(request.notional_usd))
        };
        NewOrderBody {
            symbol: self.venue_symbol(&request.symbol),
            side: request.side,
            order_type: request.order_type,
            time_in_force: "gtc",
            client_order_id: request.client_order_id.to_string(),
            qty,
            notional,
            limit_price: request.limit_price.map(|p| p.inner()),
        }
    }
}

impl Broker for AlpacaBroker {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn submit_order<'a>(&'a self, request: &'a OrderRequest) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            let body = self.order_body(request);
            debug!(
                client_order_id = %request.client_order_id,
                symbol = %body.symbol,
                "Submitting order to Alpaca"
            );
            let order: AlpacaOrder = self
                .send("submit", self.client.post(self.url("/v2/orders")).json(&body))
                .await?;
            Ok(to_broker_order(order))
        })
    }

    fn cancel_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            let url = self.url(&format!("/v2/orders/{broker_order_id}"));
            let started = Instant::now();
            let result = self.send_inner(self.client.delete(url)).await;
            atlas_telemetry::Metrics::broker_latency(
                "alpaca",
                "cancel",
                started.elapsed().as_secs_f64() * 1000.0,
            );
            result.map(|_| ())
        })
    }

    fn get_order<'a>(&'a self, broker_order_id: &'a str) -> BoxFuture<'a, BrokerResult<BrokerOrder>> {
        Box::pin(async move {
            let url = self.url(&format!("/v2/orders/{broker_order_id}"));
            let order: AlpacaOrder = self.send("get_order", self.client.get(url)).await?;
            Ok(to_broker_order(order))
        })
    }

    fn get_account(&self) -> BoxFuture<'_, BrokerResult<AccountInfo>> {
        Box::pin(async move {
            let account: AlpacaAccount = self
                .send("account", self.client.get(self.url("/v2/account")))
                .await?;
            Ok(AccountInfo {
                account_id: account.id,
                cash: account.cash,
                buying_power: account.buying_power,
                equity: account.equity,
            })
        })
    }

    fn get_positions(&self) -> BoxFuture<'_, BrokerResult<Vec<BrokerPosition>>> {
        Box::pin(async move {
            let positions: Vec<AlpacaPosition> = self
                .send("positions", self.client.get(self.url("/v2/positions")))
                .await?;
            positions
                .into_iter()
                .map(|p| {
                    let side = p
                        .side
                        .parse::<OrderSide>()
                        .map_err(|e| BrokerError::Decode(e.to_string()))?;
                    let symbol = p.symbol.replace('/', "");
                    Ok(BrokerPosition {
                        symbol: symbol
                            .trim_end_matches(self.config.quote_currency.as_str())
                            .to_string(),
                        side,
                        qty: Size::new(p.qty.abs()),
                        avg_entry_price: Price::new(p.avg_entry_price),
                    })
                })
                .collect()
        })
    }
}
