//! Decision agent boundary.
//!
//! An agent turns a bundle of market, risk and pattern context into a
//! verdict with trade parameters. The engine treats agents as black boxes
//! behind the `DecisionAgent` trait; `ThresholdAgent` is the deterministic
//! implementation used in paper mode and tests.

use crate::config::AgentConfig;
use crate::error::StrategyResult;
use atlas_core::{MarketSnapshot, OrderSide, Price, RiskState};
use atlas_store::BoxFuture;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Wait,
    Block,
}

/// Trade parameters attached to a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionParams {
    pub side: OrderSide,
    pub qty_usd: Decimal,
    pub entry_price: Option<Price>,
    pub stop_loss: Option<Price>,
    pub take_profit: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Confidence in `0..=1`.
    pub confidence: Decimal,
    /// Present when the agent proposes a trade.
    pub params: Option<DecisionParams>,
    pub reason: String,
}

impl Decision {
    pub fn wait(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Wait,
            confidence: Decimal::ZERO,
            params: None,
            reason: reason.into(),
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Block,
            confidence: Decimal::ZERO,
            params: None,
            reason: reason.into(),
        }
    }

    /// Approved with parameters.
    pub fn is_actionable(&self) -> bool {
        self.verdict == Verdict::Approve && self.params.is_some()
    }
}

/// Recently detected chart pattern or signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentPattern {
    pub name: String,
    pub side: OrderSide,
    /// Strength in `0..=1`.
    pub strength: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Everything an agent sees for one decision.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub market: MarketSnapshot,
    pub risk: RiskState,
    pub recent_patterns: Vec<RecentPattern>,
    pub config: AgentConfig,
    pub now: DateTime<Utc>,
}

/// Black-box decision function.
pub trait DecisionAgent: Send + Sync {
    fn name(&self) -> &str;

    fn decide<'a>(&'a self, input: &'a DecisionInput) -> BoxFuture<'a, StrategyResult<Decision>>;
}

/// Deterministic agent: sums signed pattern strengths and approves when
/// the score and market conditions clear configured thresholds.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdAgent;

impl ThresholdAgent {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous decision logic.
    pub fn evaluate(&self, input: &DecisionInput) -> Decision {
        let config = &input.config;

        if input.risk.kill_switch_active {
            return Decision::block("kill switch active");
        }

        match input.market.staleness_ms(input.now) {
            Some(age) if age <= config.max_staleness_ms => {}
            Some(age) => return Decision::wait(format!("market data {age}ms old")),
            None => return Decision::wait("no market data"),
        }

        let Some(entry) = input.market.mid_price().or(input.market.mark_price) else {
            return Decision::wait("no reference price");
        };

        if let Some(spread_pct) = input.market.spread_pct() {
            if spread_pct > config.max_spread_pct {
                return Decision::wait(format!("spread {spread_pct}% too wide"));
            }
        }

        let score: Decimal = input
            .recent_patterns
            .iter()
            .map(|p| p.strength.clamp(Decimal::ZERO, Decimal::ONE) * p.side.sign())
            .sum();
        if score.abs() < config.min_signal {
            return Decision::wait(format!("signal {score} below threshold"));
        }

        let side = if score > Decimal::ZERO {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let confidence = score.abs().min(Decimal::ONE);
        let hundred = Decimal::ONE_HUNDRED;
        let (stop, target) = match side {
            OrderSide::Buy => (
                entry * ((hundred - config.stop_loss_pct) / hundred),
                entry * ((hundred + config.take_profit_pct) / hundred),
            ),
            OrderSide::Sell => (
                entry * ((hundred + config.stop_loss_pct) / hundred),
                entry * ((hundred - config.take_profit_pct) / hundred),
            ),
        };

        let params = DecisionParams {
            side,
            qty_usd: config.qty_usd,
            entry_price: Some(entry),
            stop_loss: Some(stop),
            take_profit: Some(target),
        };

        let verdict = if confidence >= config.min_confidence {
            Verdict::Approve
        } else {
            Verdict::Wait
        };
        debug!(
            symbol = %input.market.symbol,
            %score,
            %confidence,
            ?verdict,
            "Threshold agent decision"
        );

        Decision {
            verdict,
            confidence,
            params: Some(params),
            reason: format!("pattern score {score}"),
        }
    }
}

impl DecisionAgent for ThresholdAgent {
    fn name(&self) -> &str {
        "threshold"
    }

    fn decide<'a>(&'a self, input: &'a DecisionInput) -> BoxFuture<'a, StrategyResult<Decision>> {
        Box::pin(async move { Ok(self.evaluate(input)) })
    }
}
