//! Retry of transient broker failures.
//!
//! Backoff: `base * 2^(attempt - 1)`, capped. The same `OrderRequest`
//! (and so the same client order id) is resent on every attempt.

use crate::broker::{Broker, BrokerOrder, OrderRequest};
use crate::error::BrokerResult;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    4_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// No retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Submit `request`, retrying transient failures per `policy`.
pub async fn submit_with_retry(
    broker: &dyn Broker,
    request: &OrderRequest,
    policy: &RetryPolicy,
) -> BrokerResult<BrokerOrder> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let started = Instant::now();
        let result = broker.submit_order(request).await;
        atlas_telemetry::Metrics::broker_latency(
            broker.name(),
            "submit_attempt",
            started.elapsed().as_secs_f64() * 1000.0,
        );

        match result {
            Ok(order) => {
                debug!(
                    broker = broker.name(),
                    client_order_id = %request.client_order_id,
                    attempt,
                    status = %order.status,
                    "Broker accepted order"
                );
                return Ok(order);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    broker = broker.name(),
                    client_order_id = %request.client_order_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient broker error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
